use coreidle_core::{ReadSource, RegisterRequest, RegisterResponse};

pub fn run(engine: &super::EngineArgs, core: u32, register: u32, json: bool) {
    let endpoint = super::make_endpoint(engine);
    let response = endpoint.submit_register_read(&RegisterRequest { core, register });

    if json {
        super::print_json(&response);
    } else {
        println!("{}", describe(&response));
    }
    if !response.ready {
        std::process::exit(1);
    }
}

pub(crate) fn describe(r: &RegisterResponse) -> String {
    match r.source {
        ReadSource::Live => format!(
            "core {} {:#x} = {:#018x} ({})",
            r.core, r.register, r.value, r.value
        ),
        ReadSource::Cached => format!(
            "core {} {:#x} = {:#018x} ({}) [cached, core is idling]",
            r.core, r.register, r.value, r.value
        ),
        ReadSource::Unavailable => format!("core {} {:#x}: not available", r.core, r.register),
    }
}
