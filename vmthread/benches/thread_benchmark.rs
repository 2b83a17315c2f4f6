//!   cargo bench --bench thread_benchmark

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use vmthread::{Isolate, IsolateCreateInfo, ObjectRef, Thread, Vm, VmCreateInfo};

fn attached_isolate() -> std::sync::Arc<Isolate> {
    if Vm::get().is_none() {
        Vm::bootstrap(VmCreateInfo::default()).expect("vm bootstrap");
    }
    let isolate = Isolate::new(IsolateCreateInfo::default()).expect("isolate");
    Thread::ensure_init();
    isolate
}

fn bench_store_buffer(c: &mut Criterion) {
    let isolate = attached_isolate();
    Thread::enter_isolate(&isolate);
    let mut thread = Thread::ensure_init();

    c.bench_function("store_buffer_add_object", |b| {
        let mut n = 0usize;
        b.iter(|| {
            n = n.wrapping_add(8);
            thread.store_buffer_add_object(black_box(ObjectRef::from_addr(n)));
        })
    });
    isolate.store_buffer().take_records();

    c.bench_function("scoped_resource_push_pop", |b| {
        b.iter(|| {
            let outer = thread.acquire_resource("outer");
            let inner = thread.acquire_resource("inner");
            drop(black_box(inner));
            drop(black_box(outer));
        })
    });

    c.bench_function("reusable_handle_checkout", |b| {
        b.iter(|| {
            let mut handle = thread.array_handle();
            handle.set(black_box(ObjectRef::from_addr(64)));
            black_box(handle.get())
        })
    });

    Thread::exit_isolate();
}

fn bench_attach(c: &mut Criterion) {
    let isolate = attached_isolate();
    c.bench_function("enter_exit_isolate", |b| {
        b.iter(|| {
            Thread::enter_isolate(black_box(&isolate));
            Thread::exit_isolate();
        })
    });
    c.bench_function("thread_current", |b| b.iter(|| black_box(Thread::current())));
}

criterion_group!(benches, bench_store_buffer, bench_attach);
criterion_main!(benches);
