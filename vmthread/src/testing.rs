use std::sync::Once;

use crate::{Vm, VmCreateInfo};

static INIT: Once = Once::new();

/// Runs both lifecycle hooks once per test binary.
pub fn vm() -> &'static Vm {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
        Vm::bootstrap(VmCreateInfo::default()).expect("vm bootstrap");
    });
    Vm::get().expect("vm initialized")
}
