//! Runtimes built from configuration files

use std::io::Write;

use kiln_engine::jit::bytecode::{Assembler, Opcode};
use kiln_engine::vm::{ClassDef, MethodDef, MethodFlags};
use kiln_engine::{CompileMode, ConfigError, EngineConfig, Runtime, Value, VmError};

fn write_config(dir: &tempfile::TempDir, body: &str) -> std::path::PathBuf {
    let path = dir.path().join("kiln.toml");
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(body.as_bytes()).unwrap();
    path
}

#[test]
fn test_runtime_from_aot_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        &dir,
        "compile_mode = \"aot\"\nmax_inline_depth = 1\nrendezvous_timeout_ms = 5000\ncode_cache_max_methods = 8\n",
    );
    let config = EngineConfig::load(&path).unwrap();
    assert_eq!(config.compile_mode, CompileMode::Aot);
    assert_eq!(config.rendezvous_timeout_ms, Some(5000));

    let rt = Runtime::new(config).unwrap();
    assert_eq!(rt.code_cache().capacity(), 8);

    let mut a = Assembler::new();
    a.load(Opcode::Iload, 0).load(Opcode::Iload, 0).op(Opcode::Imul).op(Opcode::Ireturn);
    let class = rt
        .define_class(ClassDef::new("Sq").method(MethodDef::bytecode(
            "sq",
            "(I)I",
            MethodFlags::PUBLIC | MethodFlags::STATIC,
            a.finish_code(1, 2).unwrap(),
        )))
        .unwrap();
    let sq = class.declared_method("sq", "(I)I").unwrap().clone();
    let thread = rt.attach_thread("main").unwrap();

    assert_eq!(rt.invoke(&thread, &sq, &[Value::Int(12)]).unwrap(), Some(Value::Int(144)));
    assert_eq!(rt.compile(&sq).unwrap().mode(), CompileMode::Aot);
}

#[test]
fn test_invalid_file_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(&dir, "thin_lock_max_recursion = 300\n");
    match EngineConfig::load(&path) {
        Err(ConfigError::Invalid { field, .. }) => assert_eq!(field, "thin_lock_max_recursion"),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_runtime_validates_config_built_in_code() {
    let config = EngineConfig {
        thread_stack_size: 64 * 1024,
        stack_guard_size: 64 * 1024,
        ..EngineConfig::default()
    };
    assert!(matches!(Runtime::new(config), Err(VmError::Config(ConfigError::Invalid { .. }))));
}
