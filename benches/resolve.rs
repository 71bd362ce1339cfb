//! Benchmarks the hot resolution and dispatch paths.

#[macro_use] extern crate criterion;
extern crate xenon;

use criterion::Criterion;
use xenon::cpu::{Options, Processor, ThreadState};
use xenon::cpu::export_resolver::ExportResolver;
use xenon::cpu::module::RawModule;
use xenon::memory::ArrayMemory;

use std::sync::Arc;

fn ready_processor() -> Processor {
    let memory = Arc::new(ArrayMemory::from_words(0x8201_0000, &[
        0x3860_0001,    // li r3, 1
        0x6000_0000,    // nop
        0x4E80_0020,    // blr
    ]));
    let mut processor = Processor::new(
        memory,
        Arc::new(ExportResolver::new()),
        None,
        Options::default(),
    );
    processor.setup().expect("setup failed");
    processor.add_module(Arc::new(RawModule::new("bench", 0x8201_0000, 0x8201_1000)));
    processor
}

/// Repeated resolution of an already-translated address; this is the path
/// every guest call takes after the first.
fn resolve_ready_function(c: &mut Criterion) {
    let processor = ready_processor();
    processor.resolve_function(0x8201_0000).expect("initial resolution failed");

    c.bench_function("resolve ready function", move |b| {
        b.iter(|| processor.resolve_function(0x8201_0000).unwrap().address())
    });
}

/// Full guest-call entry sequence into a builtin handler.
fn dispatch_builtin(c: &mut Criterion) {
    let processor = ready_processor();
    let function = processor.define_builtin("bench", |_, arg0, _| arg0, 7, 0);
    let address = function.address();

    c.bench_function("dispatch builtin", move |b| {
        let mut state = ThreadState::new(1, 0x7000_0000);
        b.iter(|| processor.execute_with_args(&mut state, address, &[1, 2]))
    });
}

criterion_group!(benches, resolve_ready_function, dispatch_builtin);
criterion_main!(benches);
