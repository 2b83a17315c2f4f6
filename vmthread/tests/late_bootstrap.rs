//! Threads registered before the VM lifecycle hooks run. Kept in its own
//! binary so the process-wide VM is still uninitialised when it starts.
use std::{sync::mpsc, thread};

use vmthread::{CachedConstant, Thread, Vm, VmCreateInfo};

#[test]
fn thread_registered_before_bootstrap_sees_vm_constants() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (ready_tx, ready_rx) = mpsc::channel();
    let (go_tx, go_rx) = mpsc::channel::<()>();

    let compiler = thread::spawn(move || {
        let thread = Thread::ensure_init();
        assert!(thread.constants().object_null.is_null());
        ready_tx.send(()).unwrap();
        go_rx.recv().unwrap();

        let vm = Vm::get().unwrap();
        let bool_true = vm.specials().bool_true;
        assert!(Thread::can_load_from_thread(bool_true));
        assert_eq!(
            Thread::offset_from_thread(bool_true),
            Some(Thread::constant_offset(CachedConstant::BoolTrue))
        );
        let stubs = vm.stubs().unwrap();
        assert!(Thread::can_load_from_thread(stubs.invoke_dart_code.code));
        assert_eq!(thread.constants().bool_true, bool_true);
    });

    ready_rx.recv().unwrap();
    Vm::bootstrap(VmCreateInfo::default()).unwrap();
    go_tx.send(()).unwrap();
    compiler.join().unwrap();
}
