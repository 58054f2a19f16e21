use parking_lot::Mutex;
use sharpbind_core::codegen::native::{
    MANIFEST_FILE, STATUS_BAD_ARG_COUNT, STATUS_NULL_SELF, STATUS_OK, TrampolineExporter,
};
use sharpbind_core::model::{
    DocumentAttributes, FunctionFlags, FunctionRecord, ParamDirection, ParamRecord, TypeKind, TypeRecord,
    TypeRef,
};
use sharpbind_core::{BindingContext, BindingSchema, FunctionId, TypeDefinitionDocument};
use sharpbind_host::backend::{BackendKind, DispatchStatus, RuntimeBackend};
use sharpbind_host::config::EntryPoint;
use sharpbind_host::library::SymbolTable;
use sharpbind_host::marshal::{Decoder, Encoder};
use sharpbind_host::reflection::ReflectionRegistry;
use sharpbind_host::{BackendError, HostConfig, HostError, HostState, ManagedMethod, RuntimeHost, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

#[derive(Default)]
struct Probe {
    started: AtomicBool,
    shut_down: AtomicBool,
    assemblies: Mutex<Vec<PathBuf>>,
}

#[derive(Default)]
struct FakeBackend {
    probe: Arc<Probe>,
    fail_start: bool,
    missing_entry: bool,
}

impl FakeBackend {
    fn respond(values: &[Value], response: &mut [u8]) -> DispatchStatus {
        let mut encoder = Encoder::new();
        encoder.values(values);
        let bytes = encoder.finish();
        if bytes.len() > response.len() {
            return DispatchStatus::BufferTooSmall(bytes.len());
        }
        response[..bytes.len()].copy_from_slice(&bytes);
        DispatchStatus::Completed(bytes.len())
    }
}

impl RuntimeBackend for FakeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Mono
    }

    fn start(&mut self, _config: &HostConfig) -> Result<(), BackendError> {
        if self.fail_start {
            return Err(BackendError::StartFailed("no runtime installed".into()));
        }
        self.probe.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn load_assembly(&mut self, path: &Path) -> Result<(), BackendError> {
        self.probe.assemblies.lock().push(path.to_path_buf());
        Ok(())
    }

    fn resolve_entry_point(&mut self, entry: &EntryPoint) -> Result<(), BackendError> {
        if self.missing_entry {
            return Err(BackendError::MissingMethod(entry.qualified()));
        }
        Ok(())
    }

    fn dispatch(&self, request: &[u8], response: &mut [u8]) -> Result<DispatchStatus, BackendError> {
        let (method, args) = Decoder::request(request).map_err(|e| BackendError::Protocol(e.to_string()))?;
        Ok(match (method.as_str(), args.as_slice()) {
            ("SharpBind.Engine.Actor:OnHit", [Value::Handle(_), Value::I32(damage), _]) => {
                Self::respond(&[Value::I32(damage * 2), Value::Bool(true)], response)
            }
            ("Game.Echo:Repeat", [Value::String(text), Value::I32(times)]) => {
                Self::respond(&[Value::String(text.repeat(*times as usize))], response)
            }
            ("Game.Echo:Throw", _) => DispatchStatus::Exception("InvalidOperationException: boom".into()),
            _ => DispatchStatus::MethodNotFound,
        })
    }

    fn shutdown(&mut self) {
        self.probe.shut_down.store(true, Ordering::SeqCst);
    }
}

fn param(name: &str, ty: TypeRef, direction: ParamDirection) -> ParamRecord {
    ParamRecord {
        name: name.into(),
        ty,
        direction,
    }
}

fn function(name: &str, params: Vec<ParamRecord>, ret: Option<TypeRef>, flags: FunctionFlags) -> FunctionRecord {
    FunctionRecord {
        name: name.into(),
        params,
        return_type: ret,
        flags,
    }
}

fn document() -> TypeDefinitionDocument {
    let fast = FunctionFlags::NATIVE_CALLABLE | FunctionFlags::FAST_INVOKE_ELIGIBLE;
    let mut math = TypeRecord::new("Math", "Core", TypeKind::Class);
    math.functions = vec![
        function(
            "Add",
            vec![
                param("A", TypeRef::Int32, ParamDirection::In),
                param("B", TypeRef::Int32, ParamDirection::In),
                param("Product", TypeRef::Int32, ParamDirection::Out),
            ],
            Some(TypeRef::Int32),
            fast | FunctionFlags::STATIC,
        ),
        function(
            "Negate",
            vec![param("Value", TypeRef::Int64, ParamDirection::In)],
            Some(TypeRef::Int64),
            fast | FunctionFlags::STATIC,
        ),
        function(
            "Describe",
            vec![param("Value", TypeRef::Int32, ParamDirection::In)],
            Some(TypeRef::String),
            FunctionFlags::NATIVE_CALLABLE | FunctionFlags::STATIC,
        ),
    ];
    let mut actor = TypeRecord::new("Actor", "Engine", TypeKind::Class);
    actor.functions = vec![
        function(
            "Scale",
            vec![param("Factor", TypeRef::Float, ParamDirection::In)],
            Some(TypeRef::Float),
            fast,
        ),
        function(
            "OnHit",
            vec![
                param("Damage", TypeRef::Int32, ParamDirection::In),
                param("Handled", TypeRef::Bool, ParamDirection::Out),
            ],
            Some(TypeRef::Int32),
            FunctionFlags::EVENT,
        ),
    ];
    TypeDefinitionDocument::new(
        "5.4",
        DocumentAttributes::ALLOW_FAST_INVOKE_GENERATION,
        vec![math, actor],
    )
}

unsafe extern "C" fn math_add(args: *mut u8, argc: i32, ret: *mut u8) -> i32 {
    if argc != 3 {
        return STATUS_BAD_ARG_COUNT;
    }
    unsafe {
        let a = (args as *const i32).read();
        let b = (args.add(4) as *const i32).read();
        (args.add(8) as *mut i32).write(a * b);
        (ret as *mut i32).write(a + b);
    }
    STATUS_OK
}

unsafe extern "C" fn actor_scale(args: *mut u8, argc: i32, ret: *mut u8) -> i32 {
    if argc != 2 {
        return STATUS_BAD_ARG_COUNT;
    }
    unsafe {
        if (args as *const usize).read() == 0 {
            return STATUS_NULL_SELF;
        }
        let factor = (args.add(8) as *const f32).read();
        (ret as *mut f32).write(factor * 2.0);
    }
    STATUS_OK
}

struct Fixture {
    _dir: tempfile::TempDir,
    config: HostConfig,
    symbols: SymbolTable,
    probe: Arc<Probe>,
    registry: Arc<ReflectionRegistry>,
}

/// Generates trampolines for the document and exports two of the three.
fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let ctx = BindingContext::create(Arc::new(document()), dir.path(), BindingSchema::NativeBinding);
    let exporter = TrampolineExporter::new(&ctx);
    let output = exporter.export();
    assert!(output.report.is_success());

    let symbol = |ty: &str, f: &str| output.manifest.find(&FunctionId::new(ty, f)).unwrap().symbol.clone();
    let mut symbols = SymbolTable::new();
    symbols.register(symbol("Math", "Add"), math_add);
    symbols.register(symbol("Actor", "Scale"), actor_scale);

    let mut config = HostConfig::new(dir.path());
    config.fast_invoke_manifest = Some(exporter.root_directory().join(MANIFEST_FILE));
    config.assemblies.push(PathBuf::from("Managed/Game.dll"));

    let registry = Arc::new(ReflectionRegistry::new());
    registry.register(FunctionId::new("Math", "Describe"), |args| match args {
        [Value::I32(v)] => Ok(Value::String(format!("#{v}"))),
        _ => Err(HostError::Marshal("expected one int32".into())),
    });

    Fixture {
        _dir: dir,
        config,
        symbols,
        probe: Arc::new(Probe::default()),
        registry,
    }
}

fn start(host: &RuntimeHost, fixture: &Fixture) -> Result<(), HostError> {
    let backend = FakeBackend {
        probe: fixture.probe.clone(),
        ..FakeBackend::default()
    };
    host.initialize_with(
        Box::new(backend),
        fixture.registry.clone(),
        Some(Box::new(fixture.symbols.clone())),
        &fixture.config,
    )
}

#[test]
fn test_initialize_loads_assemblies_and_trampolines() {
    let fixture = fixture();
    let host = RuntimeHost::new();
    start(&host, &fixture).unwrap();

    assert_eq!(host.state(), HostState::Ready);
    assert!(fixture.probe.started.load(Ordering::SeqCst));
    let assemblies = fixture.probe.assemblies.lock().clone();
    assert_eq!(assemblies.len(), 2);
    assert!(assemblies[0].ends_with("Managed/SharpBind.Runtime.dll"));
    assert!(assemblies[1].ends_with("Managed/Game.dll"));
    // Negate is in the manifest but not exported, so it stays on reflection.
    assert_eq!(
        host.direct_functions(),
        vec![FunctionId::new("Actor", "Scale"), FunctionId::new("Math", "Add")]
    );
}

#[test]
fn test_direct_calls_use_packed_frames() {
    let fixture = fixture();
    let host = RuntimeHost::new();
    start(&host, &fixture).unwrap();

    let add = host.bind(&FunctionId::new("Math", "Add")).unwrap();
    assert!(add.is_direct());
    let mut args = [Value::I32(6), Value::I32(7), Value::Void];
    assert_eq!(host.invoke(&add, &mut args), Ok(Value::I32(13)));
    assert_eq!(args[2], Value::I32(42));

    let scale = host.bind(&FunctionId::new("Actor", "Scale")).unwrap();
    let mut args = [Value::Handle(0x1000), Value::F32(1.5)];
    assert_eq!(host.invoke(&scale, &mut args), Ok(Value::F32(3.0)));

    let mut args = [Value::Handle(0), Value::F32(1.5)];
    assert_eq!(
        host.invoke(&scale, &mut args),
        Err(HostError::NativeCallFailed {
            function: "Actor.Scale".into(),
            status: STATUS_NULL_SELF,
        })
    );
}

#[test]
fn test_reflection_fallback() {
    let fixture = fixture();
    let host = RuntimeHost::new();
    start(&host, &fixture).unwrap();

    let describe = host.bind(&FunctionId::new("Math", "Describe")).unwrap();
    assert!(!describe.is_direct());
    assert_eq!(host.invoke(&describe, &mut [Value::I32(5)]), Ok(Value::from("#5")));

    let negate = host.bind(&FunctionId::new("Math", "Negate")).unwrap();
    assert!(!negate.is_direct());
    assert_eq!(
        host.invoke(&negate, &mut [Value::I64(1)]),
        Err(HostError::UnknownFunction("Math.Negate".into()))
    );

    fixture
        .registry
        .register(FunctionId::new("Math", "Negate"), |args| match args {
            [Value::I64(v)] => Ok(Value::I64(-*v)),
            _ => Err(HostError::Marshal("expected one int64".into())),
        });
    assert_eq!(host.invoke(&negate, &mut [Value::I64(1)]), Ok(Value::I64(-1)));
}

#[test]
fn test_managed_calls() {
    let fixture = fixture();
    let host = RuntimeHost::new();
    start(&host, &fixture).unwrap();

    let doc = document();
    let actor = doc.find_type("Actor").unwrap();
    let on_hit = ManagedMethod::for_function(actor, actor.function("OnHit").unwrap());
    let mut args = [Value::Handle(0x2000), Value::I32(10), Value::Void];
    assert_eq!(host.call_managed(&on_hit, &mut args), Ok(Value::I32(20)));
    assert_eq!(args[2], Value::Bool(true));

    // Larger than the first response buffer, so the host retries once.
    let repeat = ManagedMethod::new(
        "Game.Echo:Repeat",
        vec![ParamDirection::In, ParamDirection::In],
        true,
    );
    let result = host
        .call_managed(&repeat, &mut [Value::from("abcd"), Value::I32(300)])
        .unwrap();
    assert_eq!(result.as_str().map(str::len), Some(1200));

    let throw = ManagedMethod::new("Game.Echo:Throw", vec![], false);
    assert_eq!(
        host.call_managed(&throw, &mut []),
        Err(HostError::ManagedException("InvalidOperationException: boom".into()))
    );

    let missing = ManagedMethod::new("Game.Echo:Nothing", vec![], false);
    assert_eq!(
        host.call_managed(&missing, &mut []),
        Err(HostError::UnknownFunction("Game.Echo:Nothing".into()))
    );
}

#[test]
fn test_failed_start() {
    let fixture = fixture();
    let host = RuntimeHost::new();
    let backend = FakeBackend {
        fail_start: true,
        ..FakeBackend::default()
    };
    let err = host
        .initialize_with(Box::new(backend), fixture.registry.clone(), None, &fixture.config)
        .unwrap_err();
    assert_eq!(err, HostError::Backend(BackendError::StartFailed("no runtime installed".into())));
    assert_eq!(host.state(), HostState::Failed);
    assert!(host.failure().unwrap().contains("no runtime installed"));
    assert!(matches!(
        host.bind(&FunctionId::new("Math", "Add")),
        Err(HostError::Unavailable { .. })
    ));

    host.shutdown().unwrap();
    assert_eq!(host.state(), HostState::Terminated);
    assert_eq!(
        start(&host, &fixture),
        Err(HostError::InvalidTransition(HostState::Terminated))
    );
}

#[test]
fn test_partial_start_is_torn_down() {
    let fixture = fixture();
    let host = RuntimeHost::new();
    let backend = FakeBackend {
        probe: fixture.probe.clone(),
        missing_entry: true,
        ..FakeBackend::default()
    };
    let err = host
        .initialize_with(Box::new(backend), fixture.registry.clone(), None, &fixture.config)
        .unwrap_err();
    assert!(matches!(err, HostError::Backend(BackendError::MissingMethod(_))));
    assert_eq!(host.state(), HostState::Failed);
    assert!(fixture.probe.shut_down.load(Ordering::SeqCst));
}

#[test]
fn test_missing_manifest_fails_start() {
    let mut fixture = fixture();
    fixture.config.fast_invoke_manifest = Some(PathBuf::from("Native/Absent.json"));
    let host = RuntimeHost::new();
    let err = start(&host, &fixture).unwrap_err();
    assert!(matches!(err, HostError::Backend(BackendError::Manifest { .. })));
    assert_eq!(host.state(), HostState::Failed);
}

#[test]
fn test_shutdown_revokes_bindings() {
    let fixture = fixture();
    let host = RuntimeHost::new();
    start(&host, &fixture).unwrap();
    let add = host.bind(&FunctionId::new("Math", "Add")).unwrap();

    host.shutdown().unwrap();
    assert_eq!(host.state(), HostState::Terminated);
    assert!(fixture.probe.shut_down.load(Ordering::SeqCst));
    let mut args = [Value::I32(1), Value::I32(2), Value::Void];
    assert_eq!(host.invoke(&add, &mut args), Err(HostError::NotInitialized));
    assert_eq!(host.shutdown(), Err(HostError::InvalidTransition(HostState::Terminated)));
}

#[test]
fn test_binding_is_tied_to_its_host() {
    let fixture = fixture();
    let first = RuntimeHost::new();
    let second = RuntimeHost::new();
    start(&first, &fixture).unwrap();
    start(&second, &fixture).unwrap();

    let add = first.bind(&FunctionId::new("Math", "Add")).unwrap();
    let mut args = [Value::I32(1), Value::I32(2), Value::Void];
    assert_eq!(second.invoke(&add, &mut args), Err(HostError::NotInitialized));
    assert_eq!(first.invoke(&add, &mut args), Ok(Value::I32(3)));
}

#[test]
fn test_concurrent_calls() {
    let fixture = fixture();
    let host = RuntimeHost::new();
    start(&host, &fixture).unwrap();

    let doc = document();
    let actor = doc.find_type("Actor").unwrap();
    let on_hit = ManagedMethod::for_function(actor, actor.function("OnHit").unwrap());
    let add = host.bind(&FunctionId::new("Math", "Add")).unwrap();
    let describe = host.bind(&FunctionId::new("Math", "Describe")).unwrap();

    thread::scope(|scope| {
        for worker in 0..8i32 {
            let (host, add, describe, on_hit) = (&host, &add, &describe, &on_hit);
            scope.spawn(move || {
                for i in 0..100i32 {
                    let mut args = [Value::I32(worker), Value::I32(i), Value::Void];
                    assert_eq!(host.invoke(add, &mut args), Ok(Value::I32(worker + i)));
                    assert_eq!(args[2], Value::I32(worker * i));

                    let expected = Value::String(format!("#{i}"));
                    assert_eq!(host.invoke(describe, &mut [Value::I32(i)]), Ok(expected));

                    let mut args = [Value::Handle(0x2000), Value::I32(i), Value::Void];
                    assert_eq!(host.call_managed(on_hit, &mut args), Ok(Value::I32(i * 2)));
                }
            });
        }
    });
    assert_eq!(host.state(), HostState::Ready);
}

#[test]
fn test_reentrant_callback_while_shutdown_waits() {
    let fixture = fixture();
    let host = Arc::new(RuntimeHost::new());
    start(&host, &fixture).unwrap();

    let (entered_tx, entered_rx) = mpsc::channel();
    let entered_tx = Mutex::new(entered_tx);
    let callback_host = host.clone();
    fixture.registry.register(FunctionId::new("Math", "Reenter"), move |_| {
        entered_tx.lock().send(()).unwrap();
        // Give the shutdown below time to queue for the write lock.
        thread::sleep(Duration::from_millis(200));
        assert_eq!(callback_host.state(), HostState::Ready);
        assert!(callback_host.failure().is_none());
        assert_eq!(callback_host.direct_functions().len(), 2);
        let describe = callback_host.bind(&FunctionId::new("Math", "Describe"))?;
        callback_host.invoke(&describe, &mut [Value::I32(9)])
    });

    let reenter = host.bind(&FunctionId::new("Math", "Reenter")).unwrap();
    let (done_tx, done_rx) = mpsc::channel();
    let caller = {
        let host = host.clone();
        thread::spawn(move || {
            let result = host.invoke(&reenter, &mut []);
            done_tx.send(result).unwrap();
        })
    };

    entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let stopper = {
        let host = host.clone();
        thread::spawn(move || host.shutdown())
    };

    let result = done_rx.recv_timeout(Duration::from_secs(5)).expect("reentrant call finished");
    assert_eq!(result, Ok(Value::from("#9")));
    caller.join().unwrap();
    assert_eq!(stopper.join().unwrap(), Ok(()));
    assert_eq!(host.state(), HostState::Terminated);
    fixture.registry.unregister(&FunctionId::new("Math", "Reenter"));
}

#[test]
fn test_shutdown_waits_for_calls_in_flight() {
    let fixture = fixture();
    let host = Arc::new(RuntimeHost::new());
    start(&host, &fixture).unwrap();

    let (entered_tx, entered_rx) = mpsc::channel();
    let entered_tx = Mutex::new(entered_tx);
    let probe = fixture.probe.clone();
    fixture.registry.register(FunctionId::new("Math", "Slow"), move |_| {
        entered_tx.lock().send(()).unwrap();
        thread::sleep(Duration::from_millis(100));
        // The runtime must still be up while this call runs.
        Ok(Value::Bool(!probe.shut_down.load(Ordering::SeqCst)))
    });

    let slow = host.bind(&FunctionId::new("Math", "Slow")).unwrap();
    let caller = {
        let host = host.clone();
        let slow = slow.clone();
        thread::spawn(move || host.invoke(&slow, &mut []))
    };

    entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    host.shutdown().unwrap();
    assert!(fixture.probe.shut_down.load(Ordering::SeqCst));
    assert_eq!(caller.join().unwrap(), Ok(Value::Bool(true)));
    assert_eq!(host.invoke(&slow, &mut []), Err(HostError::NotInitialized));
}
