use pretty_assertions::assert_eq;
use resourcery::{
    Converter, DumpOptions, Error, LoadOptions, ModelSession, OpSet, Registry, RelOp,
};
use serde_json::{Value, json};

use super::support::{self, int_key};

#[test]
fn fields_by_load_from_honors_external_names() {
    let registry = support::registry();
    let mut schema = Converter::new().schema(registry.model("Album").unwrap());
    schema.field_mut("album_id").unwrap().common_mut().load_from = Some("albumId".to_string());

    assert!(schema.field_by_load_from("albumId").is_some());
    assert!(schema.field_by_load_from("album_id").is_none());
    assert!(schema.field_by_load_from("title").is_some());
}

#[test]
fn get_instance_resolves_existing_rows() {
    let (registry, mut session) = support::setup();
    let schema = registry.schema("Album").unwrap().clone();
    let data = json!({"album_id": 1}).as_object().cloned().unwrap();
    let (key, found) = schema.get_instance(&mut session, &data).unwrap();
    assert!(found);
    assert_eq!(key, int_key(1));
}

#[test]
fn get_instance_constructs_missing_rows() {
    let (registry, mut session) = support::setup();
    let schema = registry.schema("Album").unwrap().clone();
    let data = json!({"album_id": 9000, "title": "Fresh"}).as_object().cloned().unwrap();
    let (key, found) = schema.get_instance(&mut session, &data).unwrap();
    assert!(!found);
    assert_eq!(key, int_key(9000));
    assert!(session.get("Album", &key).unwrap().is_some());
}

#[test]
fn make_instance_coerces_scalars() {
    let (registry, mut session) = support::setup();
    let schema = registry.schema("Album").unwrap().clone();
    let data = json!({"album_id": "9001", "title": "Made"}).as_object().cloned().unwrap();
    let key = schema.make_instance(&mut session, &data).unwrap();
    let row = session.get("Album", &key).unwrap().unwrap();
    assert_eq!(row["album_id"], json!(9001));
    assert_eq!(row["title"], json!("Made"));
}

#[test]
fn embed_scalar_promotes_into_only() {
    let registry = support::registry();
    let schema = registry.schema("Album").unwrap();
    let mut options = DumpOptions::new();
    schema.embed(&mut options, "album_id").unwrap();
    assert!(options.only.contains("album_id"));
    assert!(options.embeds.is_empty());
}

#[test]
fn embed_unknown_field_fails() {
    let registry = support::registry();
    let schema = registry.schema("Album").unwrap();
    let mut options = DumpOptions::new();
    let err = schema.embed(&mut options, "dne");
    assert!(matches!(err, Err(Error::BadRequest { code, .. }) if code == "invalid_embed"));
}

#[test]
fn embed_scalar_dump_matches_only_projection() {
    let (registry, session) = support::setup();
    let schema = registry.schema("Album").unwrap();

    let mut embedded = DumpOptions::new();
    schema.embed(&mut embedded, "title").unwrap();
    let via_embed = schema.dump(&registry, &session, &int_key(1), &embedded).unwrap();

    let via_only = schema
        .dump(&registry, &session, &int_key(1), &DumpOptions::new().only(["title"]))
        .unwrap();
    assert_eq!(via_embed, via_only);
    assert_eq!(via_embed, json!({"title": "For Those About To Rock We Salute You"}));
}

/// Restricting a to-many field's operations lands the denial under the
/// child's `$op` key, index-aligned with the input.
#[test]
fn disallowed_op_reports_under_op_key() {
    let (registry, mut session) = support::setup();
    let mut locked = Registry::new(support::model_registry());
    for (model, collection) in [("Playlist", "playlists"), ("Track", "tracks")] {
        locked.register_default(model, collection);
    }
    let schema = Converter::new()
        .schema(registry.model("Playlist").unwrap())
        .restrict_ops("tracks", OpSet::only([RelOp::Set]));
    locked.register_schema(schema);

    let schema = locked.schema("Playlist").unwrap().clone();
    let data = json!({
        "playlist_id": 18,
        "tracks": [{"$op": "add", "track_id": 1}]
    });
    let report = schema
        .load(&locked, &mut session, &data, &LoadOptions::new().partial(true))
        .unwrap();
    assert!(!report.is_clean());
    assert!(report.errors["tracks"][0]["$op"][0].is_string());
}

#[test]
fn disallowed_op_on_to_one_escalates_in_strict_mode() {
    let (registry, mut session) = support::setup();
    let mut locked = Registry::new(support::model_registry());
    for (model, collection) in [("Track", "tracks"), ("Album", "albums")] {
        locked.register_default(model, collection);
    }
    let schema = Converter::new()
        .schema(registry.model("Track").unwrap())
        .restrict_ops("album", OpSet::none());
    locked.register_schema(schema);

    let schema = locked.schema("Track").unwrap().clone();
    let data = json!({"track_id": 1, "album": {"album_id": 1}});
    let err = schema.load(
        &locked,
        &mut session,
        &data,
        &LoadOptions::new().partial(true).strict(true),
    );
    assert!(matches!(err, Err(Error::Validation(_))));
}

#[test]
fn relationship_child_errors_keep_their_index() {
    let (registry, mut session) = support::setup();
    let schema = registry.schema("Album").unwrap().clone();
    let data = json!({
        "album_id": 1,
        "tracks": [
            {"track_id": 6, "name": "Renamed"},
            {"bytes": "TEST"}
        ]
    });
    let report = schema
        .load(&registry, &mut session, &data, &LoadOptions::new().partial(true))
        .unwrap();
    assert!(!report.is_clean());
    let tracks = report.errors["tracks"].as_array().unwrap();
    assert_eq!(tracks.len(), 2);
    assert_eq!(tracks[0], json!({}));
    assert!(tracks[1]["bytes"][0].is_string());
}

#[test]
fn bad_relationship_data_escalates_in_strict_mode() {
    let (registry, mut session) = support::setup();
    let schema = registry.schema("Track").unwrap().clone();
    let data = json!({"track_id": 1, "album": {"album_id": "TEST"}});
    let err = schema.load(
        &registry,
        &mut session,
        &data,
        &LoadOptions::new().partial(true).strict(true),
    );
    assert!(matches!(err, Err(Error::Validation(_))));
}

#[test]
fn setting_a_to_one_child_replaces_the_link() {
    let (registry, mut session) = support::setup();
    let schema = registry.schema("Track").unwrap().clone();
    let data = json!({"track_id": 1, "album": {"album_id": 347}});
    let report = schema
        .load(&registry, &mut session, &data, &LoadOptions::new().partial(true))
        .unwrap();
    assert!(report.is_clean());
    let related = session.related("Track", &int_key(1), "album").unwrap();
    assert_eq!(related[0]["album_id"], json!(347));
    // The backref reflects the move.
    assert!(!session.is_linked("Album", &int_key(1), "tracks", &int_key(1)).unwrap());
}

#[test]
fn load_onto_supplied_instance_mutates_it() {
    let (registry, mut session) = support::setup();
    let schema = registry.schema("Album").unwrap().clone();
    let data = json!({"title": "Patched Title"});
    let report = schema
        .load(
            &registry,
            &mut session,
            &data,
            &LoadOptions::new().partial(true).instance(int_key(5)),
        )
        .unwrap();
    assert!(report.is_clean());
    let row = session.get("Album", &int_key(5)).unwrap().unwrap();
    assert_eq!(row["title"], json!("Patched Title"));
}

#[test]
fn setting_a_nullable_to_one_to_null_clears_it() {
    let (registry, mut session) = support::setup();
    let schema = registry.schema("Track").unwrap().clone();
    let data = json!({"track_id": 1, "genre": null});
    let report = schema
        .load(&registry, &mut session, &data, &LoadOptions::new().partial(true))
        .unwrap();
    assert!(report.is_clean());
    assert!(session.related("Track", &int_key(1), "genre").unwrap().is_empty());
}

#[test]
fn removing_a_non_member_fails_strict() {
    let (registry, mut session) = support::setup();
    let schema = registry.schema("Album").unwrap().clone();
    let data = json!({
        "album_id": 1,
        "tracks": [{"track_id": 597, "$op": "remove"}]
    });
    let err = schema.load(
        &registry,
        &mut session,
        &data,
        &LoadOptions::new().partial(true).strict(true),
    );
    assert!(matches!(err, Err(Error::Validation(_))));
}

#[test]
fn removing_a_to_one_child_clears_the_link() {
    let (registry, mut session) = support::setup();
    let schema = registry.schema("Track").unwrap().clone();
    let data = json!({"track_id": 1, "album": {"$op": "remove", "album_id": 1}});
    let report = schema
        .load(&registry, &mut session, &data, &LoadOptions::new().partial(true))
        .unwrap();
    assert!(report.is_clean(), "errors: {}", report.errors);
    assert!(session.related("Track", &int_key(1), "album").unwrap().is_empty());
}

#[test]
fn to_one_remove_distinguishes_missing_rows_from_non_members() {
    let (registry, mut session) = support::setup();
    let schema = registry.schema("Album").unwrap().clone();

    // Ids name no row at all.
    let data = json!({"album_id": 1, "artist": {"$op": "remove", "artist_id": 999999}});
    let report = schema
        .load(&registry, &mut session, &data, &LoadOptions::new().partial(true))
        .unwrap();
    assert_eq!(
        report.errors["artist"]["$op"][0],
        json!("Could not find an entity matching the given identity.")
    );

    // The row exists but is not this album's artist.
    let data = json!({"album_id": 1, "artist": {"$op": "remove", "artist_id": 3}});
    let report = schema
        .load(&registry, &mut session, &data, &LoadOptions::new().partial(true))
        .unwrap();
    assert_eq!(
        report.errors["artist"]["$op"][0],
        json!("Entity is not a member of this collection.")
    );
    // The link survives both failed removes.
    assert!(!session.related("Album", &int_key(1), "artist").unwrap().is_empty());
}

#[test]
fn adding_an_existing_member_fails_strict() {
    let (registry, mut session) = support::setup();
    let schema = registry.schema("Album").unwrap().clone();
    let data = json!({
        "album_id": 1,
        "tracks": [{"track_id": 1, "$op": "add"}]
    });
    let err = schema.load(
        &registry,
        &mut session,
        &data,
        &LoadOptions::new().partial(true).strict(true),
    );
    assert!(matches!(err, Err(Error::Validation(_))));
}

#[test]
fn unknown_op_token_fails_strict() {
    let (registry, mut session) = support::setup();
    let schema = registry.schema("Album").unwrap().clone();
    let data = json!({
        "album_id": 1,
        "tracks": [{"track_id": 1, "$op": "test"}]
    });
    let err = schema.load(
        &registry,
        &mut session,
        &data,
        &LoadOptions::new().partial(true).strict(true),
    );
    assert!(matches!(err, Err(Error::Validation(_))));
}

#[test]
fn remove_then_add_in_one_document_is_legal() {
    let (registry, mut session) = support::setup();
    let schema = registry.schema("Playlist").unwrap().clone();
    let data = json!({
        "playlist_id": 18,
        "tracks": [
            {"track_id": 1, "$op": "add"},
            {"track_id": 597, "$op": "remove"},
            {"track_id": 597, "$op": "add"}
        ]
    });
    let report = schema
        .load(&registry, &mut session, &data, &LoadOptions::new().partial(true))
        .unwrap();
    assert!(report.is_clean(), "errors: {}", report.errors);
    let related = session.related("Playlist", &int_key(18), "tracks").unwrap();
    assert_eq!(related.len(), 2);
}

#[test]
fn missing_required_fields_reported_on_full_loads() {
    let (registry, mut session) = support::setup();
    let schema = registry.schema("Track").unwrap().clone();
    let data = json!({"track_id": 9000, "name": "Lonely"});
    let report = schema
        .load(&registry, &mut session, &data, &LoadOptions::new())
        .unwrap();
    assert!(!report.is_clean());
    assert_eq!(report.errors["milliseconds"][0], json!("Missing data for required field."));
    assert_eq!(report.errors["unit_price"][0], json!("Missing data for required field."));
}

#[test]
fn unknown_fields_are_rejected() {
    let (registry, mut session) = support::setup();
    let schema = registry.schema("Album").unwrap().clone();
    let data = json!({"album_id": 1, "dne": true});
    let report = schema
        .load(&registry, &mut session, &data, &LoadOptions::new().partial(true))
        .unwrap();
    assert_eq!(report.errors["dne"][0], json!("Unknown field."));
}

#[test]
fn non_object_document_reports_schema_error() {
    let (registry, mut session) = support::setup();
    let schema = registry.schema("Album").unwrap().clone();
    let report = schema
        .load(&registry, &mut session, &json!([1, 2]), &LoadOptions::new())
        .unwrap();
    assert!(report.key.is_none());
    assert!(report.errors["_schema"][0].is_string());
}

#[test]
fn dump_nests_one_level_by_default() {
    let (registry, session) = support::setup();
    let schema = registry.schema("Album").unwrap();
    let dumped = schema
        .dump(&registry, &session, &int_key(1), &DumpOptions::new())
        .unwrap();

    assert_eq!(dumped["album_id"], json!(1));
    assert_eq!(dumped["artist"]["name"], json!("AC/DC"));
    // Children are scalar projections: no second relationship level.
    let tracks = dumped["tracks"].as_array().unwrap();
    assert_eq!(tracks.len(), 10);
    assert!(tracks[0].get("album").is_none());
    assert!(tracks[0].get("playlists").is_none());
}

#[test]
fn dotted_embeds_extend_the_projection() {
    let (registry, session) = support::setup();
    let schema = registry.schema("Playlist").unwrap();
    let mut options = DumpOptions::new();
    schema.embed(&mut options, "tracks.genre").unwrap();
    let dumped = schema.dump(&registry, &session, &int_key(18), &options).unwrap();
    let tracks = dumped["tracks"].as_array().unwrap();
    assert_eq!(tracks[0]["genre"]["name"], json!("Rock"));
}

#[test]
fn cyclic_graphs_dump_without_recursing() {
    let (registry, session) = support::setup();
    let mut session = session;
    // Make the node graph cyclic: 2 -> 1 while 1 -> 2 already holds.
    session
        .link("Node", &int_key(2), "children", &int_key(1))
        .unwrap();
    let schema = registry.schema("Node").unwrap();
    let mut options = DumpOptions::new();
    schema.embed(&mut options, "children.children").unwrap();
    let dumped = schema.dump(&registry, &session, &int_key(1), &options).unwrap();
    let children = dumped["children"].as_array().unwrap();
    // Node 2's children would contain node 1 again; the cycle is cut.
    let node2 = children.iter().find(|child| child["node_id"] == json!(2)).unwrap();
    assert_eq!(node2["children"], json!([]));
}

#[test]
fn writable_round_trip_preserves_loaded_values() {
    let (registry, mut session) = support::setup();
    let schema = registry.schema("Track").unwrap().clone();
    let document = json!({
        "track_id": 9100,
        "name": "Round Trip",
        "composer": "Nobody",
        "milliseconds": 123456,
        "bytes": 789,
        "unit_price": "0.99"
    });
    let report = schema
        .load(&registry, &mut session, &document, &LoadOptions::new())
        .unwrap();
    assert!(report.is_clean(), "errors: {}", report.errors);
    let dumped = schema
        .dump(&registry, &session, &report.key.unwrap(), &DumpOptions::new())
        .unwrap();
    for (field, expected) in document.as_object().unwrap() {
        assert_eq!(&dumped[field], expected, "field {field} did not round-trip");
    }
}

#[test]
fn guarded_field_index_is_shared_across_clones() {
    let registry = support::registry();
    let schema = registry.schema("Album").unwrap();
    let first: Vec<&str> = schema.fields_by_load_from().map(|(name, _)| name).collect();
    let second: Vec<&str> = schema.fields_by_load_from().map(|(name, _)| name).collect();
    assert_eq!(first, second);
    assert!(first.contains(&"tracks"));
}

#[test]
fn load_report_key_matches_identity(){
    let (registry, mut session) = support::setup();
    let schema = registry.schema("Album").unwrap().clone();
    let report = schema
        .load(
            &registry,
            &mut session,
            &json!({"album_id": 1, "title": "Renamed"}),
            &LoadOptions::new().partial(true),
        )
        .unwrap();
    assert_eq!(report.key, Some(int_key(1)));
    assert_eq!(
        session.get("Album", &int_key(1)).unwrap().unwrap()["title"],
        Value::from("Renamed")
    );
}
