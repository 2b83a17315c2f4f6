use clap::Parser as ClapParser;
use std::{process, thread};

use vmthread::{
    Isolate, IsolateCreateInfo, ObjectRef, RootSet, THREAD_LAYOUT_VERSION, THREAD_OFFSETS,
    Thread, Vm, VmCreateInfo, VmError,
};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Print the thread offset table and exit
    #[arg(long, help = "Dump the offsets generated code uses")]
    dump_offsets: bool,

    /// Objects the mutator allocates and records
    #[arg(long, default_value_t = 4096)]
    objects: usize,

    /// Helper threads sampling the class table beside the mutator
    #[arg(long, default_value_t = 2)]
    helpers: usize,

    /// Per-thread store buffer block size
    #[arg(long)]
    block_size: Option<usize>,

    /// Isolate heap size in bytes
    #[arg(long)]
    heap_size: Option<usize>,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if cli.dump_offsets {
        dump_offsets();
        return;
    }

    if let Err(err) = run(&cli) {
        eprintln!("Error: {err}");
        process::exit(1);
    }
}

fn dump_offsets() {
    println!("thread layout version {THREAD_LAYOUT_VERSION:#018x}");
    for entry in THREAD_OFFSETS.iter() {
        println!("{:>6}  {}", entry.offset, entry.name);
    }
}

fn run(cli: &Cli) -> Result<(), VmError> {
    Vm::bootstrap(VmCreateInfo::default())?;
    let isolate = Isolate::new(IsolateCreateInfo {
        name: Some("main".to_string()),
        heap_size: cli.heap_size,
        store_buffer_block_size: cli.block_size,
        ..Default::default()
    })?;

    let mut main_thread = Thread::ensure_init();
    Thread::enter_isolate(&isolate);
    let class = isolate.register_class("Record", 32);
    let instance_size = isolate
        .class_table()
        .get(class)
        .map_or(32, |info| info.instance_size);

    let helpers: Vec<_> = (0..cli.helpers)
        .map(|_| {
            let isolate = isolate.clone();
            thread::spawn(move || {
                let thread = Thread::ensure_init();
                Thread::enter_isolate_as_helper(&isolate, true);
                let classes = isolate.class_table().len();
                thread.record_timeline_event("helper-scan");
                Thread::exit_isolate_as_helper();
                classes
            })
        })
        .collect();

    let result = main_thread.with_long_jump_scope(|thread| {
        let _zone = thread.enter_zone();
        for _ in 0..cli.objects {
            let obj = match thread.allocate(instance_size) {
                Ok(obj) => obj,
                Err(err) => return Err(thread.long_jump(err)),
            };
            thread.store_buffer_add_object(obj);
        }
        thread.record_timeline_event("mutator-done");
        Ok(())
    });
    if let Err(err) = &result {
        log::warn!("mutator stopped early: {err}");
    }

    for helper in helpers {
        let classes = helper.join().unwrap_or(0);
        log::info!("helper saw {classes} classes");
    }

    Thread::prepare_for_gc();
    let mut roots = isolate.safepoint_operation(|| {
        let mut roots = RootSet::collect(&mut *main_thread);
        roots.take_remembered(&isolate);
        roots
    });
    roots.remember.retain(|obj: &ObjectRef| isolate.heap().contains(*obj));

    Thread::exit_isolate();
    println!(
        "isolate '{}': {} objects, {} bytes used, {} roots, {} remembered, {} timeline events",
        isolate.name(),
        isolate.heap().object_count(),
        isolate.heap().used(),
        roots.roots.len(),
        roots.remember.len(),
        isolate.timeline_event_count(),
    );
    Thread::clean_up();
    result
}
