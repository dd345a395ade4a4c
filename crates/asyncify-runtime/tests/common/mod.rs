//! Guest fixtures shared by the integration tests.
//!
//! Guests are written in the WebAssembly text format and compiled by
//! wasmtime's built-in WAT parser. Every guest shares a bump allocator that
//! counts `allocate`/`release` calls in exported globals.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use asyncify_runtime::{AsyncifyEngine, ConfigDelegate, EngineConfig, EngineDelegate};
use tempfile::TempDir;

/// Imports, memory, counters and allocator. Scratch memory below 1024 is
/// free for fixtures; the heap starts at 4096.
pub const PRELUDE: &str = r#"
    (import "asyncify" "log" (func $log (param i32 i32)))
    (import "asyncify" "usleep" (func $usleep (param i32)))
    (import "asyncify" "uuid_v4" (func $uuid_v4 (param i32)))
    (import "asyncify" "get" (func $get (param i32 i32)))
    (import "asyncify" "get_async" (func $get_async (param i32 i32 i32)))
    (memory (export "memory") 2)
    (global $heap (mut i32) (i32.const 4096))
    (global $allocs (export "allocs") (mut i32) (i32.const 0))
    (global $releases (export "releases") (mut i32) (i32.const 0))
    (global $calls (export "calls") (mut i32) (i32.const 0))
    (func $allocate (export "allocate") (param $size i32) (result i32)
        (local $ptr i32)
        (local.set $ptr (global.get $heap))
        (global.set $heap
            (i32.and
                (i32.add (i32.add (global.get $heap) (local.get $size)) (i32.const 7))
                (i32.const -8)))
        (global.set $allocs (i32.add (global.get $allocs) (i32.const 1)))
        (local.get $ptr))
    (func (export "release") (param i32)
        (global.set $releases (i32.add (global.get $releases) (i32.const 1))))
    (func $count_call
        (global.set $calls (i32.add (global.get $calls) (i32.const 1))))
    (func $ready (param $out i32) (param $data i32) (param $len i32)
        (i32.store (local.get $out) (local.get $data))
        (i32.store offset=4 (local.get $out) (local.get $len))
        (i32.store offset=8 (local.get $out) (i32.const 0))
        (i32.store offset=12 (local.get $out) (i32.const 0))
        (i32.store offset=16 (local.get $out) (i32.const 0))
        (i32.store offset=20 (local.get $out) (i32.const 0)))
"#;

/// `call` copies the request into a fresh buffer and returns it.
pub const ECHO: &str = r#"
    (func (export "call") (param $out i32) (param $in i32) (param $len i32)
        (local $data i32)
        (call $count_call)
        (local.set $data (call $allocate (local.get $len)))
        (memory.copy (local.get $data) (local.get $in) (local.get $len))
        (call $ready (local.get $out) (local.get $data) (local.get $len)))
    (func (export "callback") (param i32 i32 i32))
"#;

/// A WAT `data` segment holding `bytes` at `offset`.
pub fn data_segment(offset: u32, bytes: &[u8]) -> String {
    let escaped: String = bytes.iter().map(|b| format!("\\{b:02x}")).collect();
    format!("(data (i32.const {offset}) \"{escaped}\")")
}

/// `call` always answers with `body`, copied into a fresh buffer.
pub fn fixed_reply(body: &[u8]) -> String {
    format!(
        r#"
    {segment}
    (func (export "call") (param $out i32) (param $in i32) (param $len i32)
        (local $data i32)
        (call $count_call)
        (local.set $data (call $allocate (i32.const {len})))
        (memory.copy (local.get $data) (i32.const 512) (i32.const {len}))
        (call $ready (local.get $out) (local.get $data) (i32.const {len})))
    (func (export "callback") (param i32 i32 i32))
"#,
        segment = data_segment(512, body),
        len = body.len(),
    )
}

pub struct Guest {
    pub dir: TempDir,
    pub path: PathBuf,
}

/// Write a guest module made of the prelude plus `body`.
pub fn write_guest(body: &str) -> Guest {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("guest.wat");
    std::fs::write(&path, format!("(module {PRELUDE} {body})")).unwrap();
    Guest { dir, path }
}

/// Write another guest module into an existing fixture directory.
pub fn write_sibling(guest: &Guest, name: &str, body: &str) -> PathBuf {
    let path = guest.dir.path().join(name);
    std::fs::write(&path, format!("(module {PRELUDE} {body})")).unwrap();
    path
}

pub fn config(guest: &Guest) -> EngineConfig {
    let mut config = EngineConfig::for_module(guest.path.clone());
    config.initialize = false;
    config.update.bundle_dir = guest.dir.path().join("bundles");
    config
}

pub async fn start_with(config: EngineConfig, delegate: Arc<dyn EngineDelegate>) -> AsyncifyEngine {
    let engine = AsyncifyEngine::new(config, delegate).unwrap();
    engine.start().await.unwrap();
    engine
}

pub async fn start(guest: &Guest) -> AsyncifyEngine {
    start_with(config(guest), Arc::new(ConfigDelegate)).await
}

/// `(allocs, releases)` counted by the guest allocator.
pub async fn balance(engine: &AsyncifyEngine) -> (i32, i32) {
    (
        engine.inspect_global("allocs").await.unwrap(),
        engine.inspect_global("releases").await.unwrap(),
    )
}
