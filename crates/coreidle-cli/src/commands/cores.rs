use coreidle_core::{CoreStatus, MAX_CORES, WorkerPhase};

pub fn run(engine: &super::EngineArgs, json: bool) {
    let endpoint = super::make_endpoint(engine);
    let orchestrator = endpoint.orchestrator();
    let status = endpoint.core_status();

    if json {
        super::print_json(&status);
        return;
    }

    let online = orchestrator.online_cores();
    println!("coreidle v{}", coreidle_core::VERSION);
    println!("  {}", orchestrator.platform().describe());
    if online >= MAX_CORES {
        println!("  {online} cores online; idle commands need fewer than {MAX_CORES}");
    }
    println!(
        "  max duration {} us, tracked registers {}",
        orchestrator.max_duration_us(),
        orchestrator
            .tracked_registers()
            .iter()
            .map(|r| format!("{r:#x}"))
            .collect::<Vec<_>>()
            .join(" ")
    );
    println!();
    println!(
        "  {:>5}  {:<8} {:<7} {:>8} {:>11}",
        "core", "phase", "target", "launches", "last resets"
    );
    for s in &status {
        println!("  {}", status_line(s));
    }
}

fn status_line(s: &CoreStatus) -> String {
    let phase = match s.phase {
        WorkerPhase::Idle => "idle",
        WorkerPhase::Arming => "arming",
        WorkerPhase::Waiting => "waiting",
        WorkerPhase::Exited => "exited",
    };
    let target = s
        .target_state
        .map(|state| state.to_string())
        .unwrap_or_else(|| "-".to_string());
    let resets = s
        .last_report
        .as_ref()
        .map(|r| r.resets.to_string())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{:>5}  {:<8} {:<7} {:>8} {:>11}",
        s.core, phase, target, s.launches, resets
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use coreidle_core::IdleState;

    #[test]
    fn test_status_line_for_untouched_core() {
        let s = CoreStatus {
            core: 3,
            phase: WorkerPhase::Idle,
            waiting: false,
            target_state: None,
            launches: 0,
            interest: Vec::new(),
            last_report: None,
        };
        let line = status_line(&s);
        assert!(line.starts_with("    3  idle"));
        assert!(line.ends_with('-'));
    }

    #[test]
    fn test_status_line_for_waiting_core() {
        let s = CoreStatus {
            core: 0,
            phase: WorkerPhase::Waiting,
            waiting: true,
            target_state: Some(IdleState::C6),
            launches: 2,
            interest: vec![0xE7],
            last_report: None,
        };
        let line = status_line(&s);
        assert!(line.contains("waiting"));
        assert!(line.contains("c6"));
    }
}
