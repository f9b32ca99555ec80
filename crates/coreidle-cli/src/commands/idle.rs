use std::sync::atomic::{AtomicBool, Ordering};

use coreidle_core::{CoreMask, CoreOutcome, IdleRequest, LaunchReport, TripOutcome, WorkerReport};

pub fn run(
    engine: &super::EngineArgs,
    core_mask: CoreMask,
    state: &str,
    duration_us: u32,
    json: bool,
) {
    let state = match super::parse_state(state) {
        Ok(id) => id,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    let endpoint = super::make_endpoint(engine);
    let request = IdleRequest {
        core_mask,
        state,
        duration_us,
    };
    let accepted = match endpoint.submit_idle_command(&request) {
        Ok(accepted) => accepted,
        Err(reason) => {
            eprintln!("Rejected (code {}): {reason}", reason.code());
            std::process::exit(2);
        }
    };

    if !json {
        println!(
            "Launch {}: cores {} -> {} for {} us",
            accepted.id, accepted.cores, accepted.state, accepted.duration_us
        );
    }

    // Workers are threads of this process. The first Ctrl+C only says so;
    // the second exits and takes them down with it.
    let interrupted = AtomicBool::new(false);
    if let Err(e) = ctrlc::set_handler(move || {
        if interrupted.swap(true, Ordering::SeqCst) {
            eprintln!("Abandoning launch.");
            std::process::exit(130);
        }
        eprintln!("Waiting for the trigger to release the cores; Ctrl+C again to abandon.");
    }) {
        log::warn!("cannot install Ctrl+C handler: {e}");
    }

    let report = match accepted.handle.join() {
        Ok(report) => report,
        Err(_) => {
            eprintln!("Error: launch thread panicked");
            std::process::exit(1);
        }
    };

    if json {
        super::print_json(&report);
    } else {
        print_report(&report);
    }
    if report.launched_cores().is_empty() {
        std::process::exit(2);
    }
}

fn print_report(report: &LaunchReport) {
    println!(
        "Finished in {} us ({} launched, {} failed)",
        report.elapsed_us,
        report.launched_cores().len(),
        report.failed_cores().len()
    );
    for launch in &report.cores {
        let line = match launch.outcome {
            CoreOutcome::Launched { armed, trip } => {
                launched_line(launch.core, armed, trip, report.worker(launch.core))
            }
            CoreOutcome::Failed { reason } => {
                format!(
                    "core {:>3}  failed   {reason} (code {})",
                    launch.core,
                    reason.code()
                )
            }
        };
        println!("  {line}");
    }
}

fn launched_line(
    core: u32,
    armed: bool,
    trip: TripOutcome,
    worker: Option<&WorkerReport>,
) -> String {
    let trip = match trip {
        TripOutcome::Written => "written",
        TripOutcome::AlreadyTripped => "already tripped",
        TripOutcome::Released => "released",
    };
    let mut line = format!("core {core:>3}  launched trip={trip}");
    if !armed {
        line.push_str(" (arm timed out)");
    }
    if let Some(w) = worker {
        line.push_str(&format!("  resets={} elapsed={} us", w.resets, w.elapsed_us));
        if let Some(r) = &w.residency {
            line.push_str(&format!(
                "  c0={} c1={} c3={} c6={} c7={} tsc={}",
                r.c0, r.c1, r.c3, r.c6, r.c7, r.tsc
            ));
        }
    }
    line
}
