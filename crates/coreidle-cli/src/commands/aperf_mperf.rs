use coreidle_core::AperfMperf;

pub fn run(engine: &super::EngineArgs, core: u32, json: bool) {
    let endpoint = super::make_endpoint(engine);
    let pair = endpoint.read_aperf_mperf(core);

    if json {
        super::print_json(&pair);
    } else {
        println!("{}", super::read::describe(&pair.aperf));
        println!("{}", super::read::describe(&pair.mperf));
        if let Some(ratio) = ratio(&pair) {
            println!("aperf/mperf = {ratio:.3}");
        }
    }
    if !(pair.aperf.ready && pair.mperf.ready) {
        std::process::exit(1);
    }
}

/// Average delivered-to-nominal frequency ratio since the counters last reset.
fn ratio(pair: &AperfMperf) -> Option<f64> {
    if !(pair.aperf.ready && pair.mperf.ready) || pair.mperf.value == 0 {
        return None;
    }
    Some(pair.aperf.value as f64 / pair.mperf.value as f64)
}
