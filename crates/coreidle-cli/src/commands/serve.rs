use std::sync::Mutex;
use std::time::Duration;

/// How long to wait for running launches after the server stops.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(16);

pub fn run(engine: &super::EngineArgs, host: &str, port: u16) {
    let endpoint = super::make_endpoint(engine);
    let orchestrator = endpoint.orchestrator().clone();

    let base = format!("http://{host}:{port}");

    println!("coreidle server v{}", coreidle_core::VERSION);
    println!("   {base}");
    println!("   {}", orchestrator.platform().describe());
    println!();
    println!("   Endpoints:");
    println!("     GET  /                       API index (try: curl {base})");
    println!("     GET  /health                 Liveness, waiting cores, cache use");
    println!("     GET  /cores                  Per-core worker status");
    println!("     POST /api/v1/idle            Idle command as JSON (?wait=true to block)");
    println!("     POST /api/v1/idle/raw        Idle command as a 76-byte record");
    println!("     GET  /api/v1/register        core=N&register=0xE7");
    println!("     POST /api/v1/register/raw    Register request as a 24-byte record");
    println!("     GET  /api/v1/aperf-mperf     core=N");
    println!();
    println!("   Examples:");
    println!(
        "     curl -X POST {base}/api/v1/idle -H 'content-type: application/json' \\"
    );
    println!(r#"          -d '{{"cores":[0,2],"state":"c6","duration_us":2000}}'"#);
    println!("     curl '{base}/api/v1/register?core=0&register=0xE7'");
    println!();

    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let tx = Mutex::new(Some(tx));
    if let Err(e) = ctrlc::set_handler(move || {
        if let Some(tx) = tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
    }) {
        log::warn!("cannot install Ctrl+C handler: {e}");
    }
    let shutdown = async move {
        let _ = rx.await;
    };

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: cannot start runtime: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = rt.block_on(coreidle_server::run_server(endpoint, host, port, shutdown)) {
        eprintln!("Error: server on {host}:{port} failed: {e}");
        std::process::exit(1);
    }

    println!("Stopping: waiting for running launches...");
    if orchestrator.shutdown(DRAIN_TIMEOUT) {
        println!("All cores released.");
    } else {
        eprintln!(
            "Launches still running after {}s; exiting anyway.",
            DRAIN_TIMEOUT.as_secs()
        );
        std::process::exit(1);
    }
}
