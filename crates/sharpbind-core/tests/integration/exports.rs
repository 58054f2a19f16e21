use super::{assembly_options, json_options, read_tree};
use sharpbind_core::binding::BindingSchema;
use sharpbind_core::codegen::managed::referenced_symbols;
use sharpbind_core::codegen::native::{FastInvokeManifest, MANIFEST_FILE};
use sharpbind_core::codegen::trampoline_symbol;
use sharpbind_core::pipeline::Pipeline;
use sharpbind_core::report::Stage;
use std::collections::BTreeSet;
use std::fs;

#[test]
fn test_fast_set_is_exactly_the_lowered_candidates() {
    let project = tempfile::tempdir().unwrap();
    let summary = Pipeline::new(json_options(project.path())).run_all().unwrap();

    let names: Vec<String> = summary
        .fast_invoke_functions
        .iter()
        .map(ToString::to_string)
        .collect();
    assert_eq!(
        names,
        vec![
            "Actor.GetLocation",
            "Actor.GetMode",
            "Actor.TakeDamage",
            "Pawn.Count",
            "Pawn.Possess"
        ]
    );

    let trampolines = summary.report(Stage::Trampolines).unwrap();
    let warned: Vec<&str> = trampolines.warnings().map(|e| e.subject.as_str()).collect();
    assert_eq!(warned, vec!["Actor.SetTags"]);
    assert!(summary.problems()[0].starts_with("warning[trampolines] Actor.SetTags: no trampoline"));
    assert!(summary.verdict().is_ok());
}

#[test]
fn test_wrappers_only_reference_generated_trampolines() {
    let project = tempfile::tempdir().unwrap();
    let summary = Pipeline::new(json_options(project.path())).run_all().unwrap();

    let root = summary.trampoline_root.clone().unwrap();
    let manifest = FastInvokeManifest::load(&root.join(MANIFEST_FILE)).unwrap();
    let generated: BTreeSet<String> = manifest.entries.iter().map(|e| e.symbol.clone()).collect();
    assert_eq!(generated.len(), summary.fast_invoke_functions.len());

    let mut referenced = BTreeSet::new();
    for (path, bytes) in read_tree(&project.path().join("Managed/Bindings")) {
        let text = String::from_utf8(bytes).unwrap();
        for symbol in referenced_symbols(&text) {
            assert!(generated.contains(symbol), "{} references {symbol}", path.display());
            referenced.insert(symbol.to_string());
        }
    }
    assert_eq!(referenced, generated);

    let actor = fs::read_to_string(project.path().join("Managed/Bindings/Engine/Actor.gen.cs")).unwrap();
    assert!(actor.contains("Invocable.Lookup(\"Actor\", \"SetTags\")"));
    assert!(actor.contains(&format!(
        "Invocable.Direct(\"{}\", 32, 4)",
        trampoline_symbol("Actor", "TakeDamage")
    )));
    assert!(actor.contains("frame.WriteHandle(16, Instigator);"));

    let pawn = fs::read_to_string(project.path().join("Managed/Bindings/Engine/Pawn.gen.cs")).unwrap();
    assert!(pawn.contains("public partial class Pawn : Actor"));
    assert!(pawn.contains("Priority = frame.Read<byte>(16);"));
}

#[test]
fn test_regeneration_is_byte_identical() {
    let project = tempfile::tempdir().unwrap();
    let pipeline = Pipeline::new(json_options(project.path()));
    pipeline.run_all().unwrap();
    let native = read_tree(&project.path().join("Intermediate/SharpBind/Native"));
    let managed = read_tree(&project.path().join("Managed/Bindings"));
    assert!(!native.is_empty());

    pipeline.run_all().unwrap();
    assert_eq!(read_tree(&project.path().join("Intermediate/SharpBind/Native")), native);
    assert_eq!(read_tree(&project.path().join("Managed/Bindings")), managed);
}

#[test]
fn test_placeholders_are_never_overwritten() {
    let project = tempfile::tempdir().unwrap();
    let pipeline = Pipeline::new(json_options(project.path()));
    pipeline.run_all().unwrap();

    let defs = project.path().join("Managed/Bindings.Defs");
    let names: Vec<String> = read_tree(&defs)
        .keys()
        .map(|p| p.to_string_lossy().replace('\\', "/"))
        .collect();
    assert_eq!(
        names,
        vec!["Core/Vector.defs.cs", "Engine/Actor.defs.cs", "Engine/Pawn.defs.cs"]
    );

    let actor_defs = defs.join("Engine/Actor.defs.cs");
    let original = fs::read_to_string(&actor_defs).unwrap();
    assert!(original.contains("public partial void OnSpawned(int Count)"));

    let edited = original.replace("partial void OnBindingInitialized()", "partial void OnBindingInitialized() // tuned");
    fs::write(&actor_defs, &edited).unwrap();
    pipeline.run_all().unwrap();
    assert_eq!(fs::read_to_string(&actor_defs).unwrap(), edited);
}

#[test]
fn test_native_schema_without_permission_uses_reflection_only() {
    let project = tempfile::tempdir().unwrap();
    let options = assembly_options(project.path(), true);
    assert_eq!(options.schema, BindingSchema::NativeBinding);
    let summary = Pipeline::new(options).run_all().unwrap();

    assert!(summary.verdict().is_ok());
    assert!(summary.fast_invoke_functions.is_empty());
    assert!(summary.trampoline_root.is_none());
    assert!(!project.path().join("Intermediate/SharpBind/Native").exists());

    let pawn = fs::read_to_string(project.path().join("Managed/Bindings/Game/Pawn.gen.cs")).unwrap();
    assert!(pawn.contains("Invocable.Lookup(\"Pawn\", \"Possess\")"));
    assert!(referenced_symbols(&pawn).is_empty());

    let checkpoint = summary.checkpoint.unwrap();
    assert!(checkpoint.ends_with("Intermediate/SharpBind/Game.bindings.ron.tmp.json"));
}

#[test]
fn test_blueprint_schema_limits_surface() {
    let project = tempfile::tempdir().unwrap();
    let mut options = json_options(project.path());
    options.schema = BindingSchema::BlueprintBinding;
    let summary = Pipeline::new(options).run_all().unwrap();
    assert!(summary.report(Stage::Trampolines).is_none());

    let actor = fs::read_to_string(project.path().join("Managed/Bindings/Engine/Actor.gen.cs")).unwrap();
    assert!(actor.contains("public string Describe()"));
    assert!(!actor.contains("TakeDamage"));
    assert!(actor.contains("public float Health"));
    assert!(!actor.contains("public string Label"));
}
