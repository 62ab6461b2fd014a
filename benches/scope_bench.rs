//! Callback scope micro-benchmarks
//!
//! Open/close is on the hot path of every dispatched callback, so it has
//! to stay cheap: a handful of loads, one small allocation, one push/pop.
//!
//! Run with: cargo bench

use std::hint::black_box;
use std::time::Instant;

use quill_native::heap::heap;
use quill_native::{CallbackScope, Environment, QuillValue};

// Simple timing macro for benchmarks
macro_rules! bench {
    ($name:expr, $iterations:expr, $code:block) => {{
        let start = Instant::now();
        for _ in 0..$iterations {
            black_box($code);
        }
        let elapsed = start.elapsed();
        let per_iter = elapsed / $iterations;
        println!(
            "{}: {} iterations in {:?} ({:?}/iter, {:.0} ops/sec)",
            $name,
            $iterations,
            elapsed,
            per_iter,
            $iterations as f64 / elapsed.as_secs_f64()
        );
        elapsed
    }};
}

fn main() {
    let env = Environment::init();
    let resource = QuillValue::pointer(heap().alloc_object().expect("allocation failed"));
    let ctx = env.async_init(resource, "bench.op").expect("async_init failed");

    println!("\n=== Callback Scope ===");
    bench!("open+close", 1_000_000u32, {
        let scope = CallbackScope::open(env, resource, &ctx).expect("open failed");
        scope.close();
    });

    bench!("enter", 1_000_000u32, {
        ctx.enter(|env| black_box(env.current_async_id()))
            .expect("enter failed")
    });

    println!("\n=== Value Conversion ===");
    bench!("resolve_object", 10_000_000u32, {
        quill_native::abi::resolve_object(resource).expect("resolve failed")
    });

    println!("\n=== Nested (depth 8) ===");
    bench!("open+close x8", 100_000u32, {
        let mut scopes = Vec::with_capacity(8);
        for _ in 0..8 {
            scopes.push(CallbackScope::open(env, resource, &ctx).expect("open failed"));
        }
        while let Some(scope) = scopes.pop() {
            scope.close();
        }
    });
}
