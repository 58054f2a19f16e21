use super::{assembly_options, fixture};
use sharpbind_core::model::{DocumentError, ParamDirection, TypeDefinitionDocument, TypeRef};
use sharpbind_core::pipeline::{Pipeline, PipelineError};
use sharpbind_core::source::{SourceKind, SourceOptions, create_document};
use std::fs;

#[test]
fn test_json_document_loads_and_round_trips() {
    let doc = create_document(
        SourceKind::JsonDocument,
        &fixture("arena.json"),
        &SourceOptions::default(),
        &[],
    )
    .unwrap();
    assert_eq!(doc.types.len(), 4);
    assert!(doc.allows_fast_invoke());
    let pawn = doc.find_type("Pawn").unwrap();
    assert_eq!(pawn.super_type.as_deref(), Some("Actor"));
    assert_eq!(
        pawn.function("Possess").unwrap().params[1].direction,
        ParamDirection::InOut
    );

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested/arena.json");
    doc.save_to_file(&path).unwrap();
    assert_eq!(TypeDefinitionDocument::load_from_file(&path).unwrap(), doc);
}

#[test]
fn test_source_directory() {
    let options = SourceOptions::default();
    let doc = create_document(SourceKind::SourceCode, &fixture("Scripts"), &options, &[]).unwrap();
    let names: Vec<&str> = doc.types.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["Rifle", "FireMode", "Weapon"]);

    let rifle = doc.find_type("Rifle").unwrap();
    assert_eq!(rifle.native_name(), "ARifle");
    assert_eq!(rifle.super_type.as_deref(), Some("Weapon"));
    assert_eq!(rifle.module, "Combat");
    assert!(rifle.function("OnReload").unwrap().is_event());

    let mode = doc.find_type("FireMode").unwrap();
    let values: Vec<i64> = mode.enum_values.iter().map(|v| v.value).collect();
    assert_eq!(values, vec![0, 3, 4]);
    assert_eq!(mode.enum_underlying(), TypeRef::UInt8);

    let spawn = doc.find_type("Weapon").unwrap().function("Spawn").unwrap();
    assert!(spawn.is_static());
    assert_eq!(spawn.params[0].ty, TypeRef::Class { meta: "Weapon".into() });
    assert_eq!(spawn.return_type, Some(TypeRef::object("Weapon")));

    let again = create_document(SourceKind::SourceCode, &fixture("Scripts"), &options, &[]).unwrap();
    assert_eq!(doc, again);
}

#[test]
fn test_assembly_pulls_referenced_source_types() {
    let project = tempfile::tempdir().unwrap();
    let pipeline = Pipeline::new(assembly_options(project.path(), true));
    let doc = pipeline.build_document().unwrap();

    let names: Vec<&str> = doc.types.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["Pawn", "Actor", "Vector"]);
    assert_eq!(doc.engine_version, "5.3");
    assert!(!doc.allows_fast_invoke());

    let modules: Vec<&str> = doc.types.iter().map(|t| t.module.as_str()).collect();
    assert_eq!(modules, vec!["Game", "Engine", "Core"]);
    assert_eq!(doc.find_type("Pawn").unwrap().super_type.as_deref(), Some("Actor"));
    // The runtime base class is not part of the document.
    assert_eq!(doc.find_type("Actor").unwrap().super_type, None);
}

#[test]
fn test_assembly_without_ignore_pattern_hits_stale_source() {
    let project = tempfile::tempdir().unwrap();
    let err = Pipeline::new(assembly_options(project.path(), false))
        .run_all()
        .unwrap_err();
    assert!(matches!(err, PipelineError::Document(DocumentError::Parse { .. })));
    assert!(err.format_display().contains("Stale.cs:2:"));
}

#[test]
fn test_unresolved_reference_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("Broken.cs");
    fs::write(&input, "[UClass] public class Broken { [UProperty] public Missing Thing; }").unwrap();
    let err = create_document(SourceKind::SourceCode, &input, &SourceOptions::default(), &[]).unwrap_err();
    match err {
        DocumentError::UnresolvedType {
            type_name,
            member,
            reference,
        } => {
            assert_eq!(type_name, "Broken");
            assert_eq!(member, "Thing");
            assert_eq!(reference, "Missing");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_missing_input_writes_nothing() {
    let project = tempfile::tempdir().unwrap();
    let mut options = super::json_options(project.path());
    options.input = project.path().join("absent.json");
    let err = Pipeline::new(options).run_all().unwrap_err();
    assert!(matches!(err, PipelineError::Validation(_)));
    assert_eq!(fs::read_dir(project.path()).unwrap().count(), 0);
}
