use pretty_assertions::assert_eq;
use resourcery::{
    CollectionQuery, Error, ModelSession, QueryParamParser, Resource,
};
use serde_json::{Value, json};

use super::support::{self, int_key};

#[test]
fn patch_updates_scalars_and_dumps() {
    let (registry, mut session) = support::setup();
    let albums = Resource::new(&registry, "albums").unwrap();
    let result = albums
        .patch(&mut session, &int_key(1), &json!({"title": "TEST"}))
        .unwrap();
    assert_eq!(result["title"], json!("TEST"));
    assert_eq!(
        session.get("Album", &int_key(1)).unwrap().unwrap()["title"],
        json!("TEST")
    );
}

#[test]
fn empty_patch_is_a_noop_dump() {
    let (registry, mut session) = support::setup();
    let albums = Resource::new(&registry, "albums").unwrap();
    let result = albums.patch(&mut session, &int_key(1), &json!({})).unwrap();
    assert_eq!(result["title"], json!("For Those About To Rock We Salute You"));
}

#[test]
fn patch_adds_an_item_to_a_list_relation() {
    let (registry, mut session) = support::setup();
    let playlists = Resource::new(&registry, "playlists").unwrap();
    let update = json!({"tracks": [{"$op": "add", "track_id": "1"}]});
    let result = playlists.patch(&mut session, &int_key(18), &update).unwrap();
    assert_eq!(result["tracks"].as_array().unwrap().len(), 2);
    assert_eq!(session.related("Playlist", &int_key(18), "tracks").unwrap().len(), 2);
}

#[test]
fn patch_adds_a_new_entity_through_a_list_relation() {
    let (registry, mut session) = support::setup();
    let playlists = Resource::new(&registry, "playlists").unwrap();
    let update = json!({
        "tracks": [{
            "$op": "add",
            "track_id": "4000",
            "name": "Test Track Seven",
            "album": {"album_id": "347"},
            "media_type": {"media_type_id": "2"},
            "genre": {"genre_id": "10"},
            "composer": "Nick Repole",
            "milliseconds": "206009",
            "bytes": "3305166",
            "unit_price": "0.99"
        }]
    });
    let result = playlists.patch(&mut session, &int_key(18), &update).unwrap();
    assert_eq!(result["tracks"].as_array().unwrap().len(), 2);
    let track = session.get("Track", &int_key(4000)).unwrap().unwrap();
    assert_eq!(track["composer"], json!("Nick Repole"));
    assert_eq!(track["milliseconds"], json!(206009));
    assert!(session.is_linked("Track", &int_key(4000), "album", &int_key(347)).unwrap());
}

#[test]
fn patch_updates_a_list_relation_member_in_place() {
    let (registry, mut session) = support::setup();
    let playlists = Resource::new(&registry, "playlists").unwrap();
    let update = json!({"tracks": [{"track_id": 597, "name": "Test Track Seven"}]});
    let result = playlists.patch(&mut session, &int_key(18), &update).unwrap();
    assert_eq!(result["tracks"].as_array().unwrap().len(), 1);
    assert_eq!(
        session.get("Track", &int_key(597)).unwrap().unwrap()["name"],
        json!("Test Track Seven")
    );
}

#[test]
fn patch_sets_fields_through_a_to_one_relation() {
    let (registry, mut session) = support::setup();
    let albums = Resource::new(&registry, "albums").unwrap();
    let result = albums
        .patch(&mut session, &int_key(1), &json!({"artist": {"name": "TEST"}}))
        .unwrap();
    assert_eq!(result["artist"]["name"], json!("TEST"));
}

#[test]
fn patch_replaces_a_to_one_relation_by_identity() {
    let (registry, mut session) = support::setup();
    let albums = Resource::new(&registry, "albums").unwrap();
    let result = albums
        .patch(&mut session, &int_key(1), &json!({"artist": {"artist_id": 3}}))
        .unwrap();
    assert_eq!(result["artist"]["name"], json!("Aerosmith"));
}

#[test]
fn patch_creates_a_new_to_one_target() {
    let (registry, mut session) = support::setup();
    let albums = Resource::new(&registry, "albums").unwrap();
    let result = albums
        .patch(
            &mut session,
            &int_key(1),
            &json!({"artist": {"artist_id": 999, "name": "Nick Repole"}}),
        )
        .unwrap();
    assert_eq!(result["artist"]["name"], json!("Nick Repole"));
    // The original artist row is untouched, only the link moved.
    assert!(session.get("Artist", &int_key(1)).unwrap().is_some());
}

#[test]
fn patch_sets_a_nullable_to_one_to_null() {
    let (registry, mut session) = support::setup();
    let tracks = Resource::new(&registry, "tracks").unwrap();
    let result = tracks
        .patch(&mut session, &int_key(1), &json!({"genre": null}))
        .unwrap();
    assert_eq!(result["genre"], Value::Null);
}

#[test]
fn patch_removes_an_item_from_a_list_relation() {
    let (registry, mut session) = support::setup();
    let playlists = Resource::new(&registry, "playlists").unwrap();
    let update = json!({"tracks": [{"track_id": 597, "$op": "remove"}]});
    let result = playlists.patch(&mut session, &int_key(18), &update).unwrap();
    assert_eq!(result["tracks"], json!([]));
    assert!(session.related("Playlist", &int_key(18), "tracks").unwrap().is_empty());
}

#[test]
fn patch_rejects_non_object_relation_values() {
    let (registry, mut session) = support::setup();
    let albums = Resource::new(&registry, "albums").unwrap();

    let err = albums.patch(&mut session, &int_key(1), &json!({"artist": 5}));
    assert!(matches!(err, Err(Error::Unprocessable { .. })));

    let err = albums.patch(&mut session, &int_key(1), &json!({"tracks": 5}));
    assert!(matches!(err, Err(Error::Unprocessable { .. })));

    let err = albums.patch(&mut session, &int_key(1), &json!({"tracks": ["TEST"]}));
    assert!(matches!(err, Err(Error::Unprocessable { .. })));
}

#[test]
fn patch_validates_list_relation_members() {
    let (registry, mut session) = support::setup();
    let albums = Resource::new(&registry, "albums").unwrap();
    let err = albums.patch(&mut session, &int_key(1), &json!({"tracks": [{"bytes": "TEST"}]}));
    match err {
        Err(Error::Unprocessable { errors }) => {
            assert!(errors["tracks"][0]["bytes"][0].is_string());
        }
        other => panic!("expected unprocessable, got {other:?}"),
    }
}

#[test]
fn failed_patch_rolls_the_session_back() {
    let (registry, mut session) = support::setup();
    let albums = Resource::new(&registry, "albums").unwrap();
    let err = albums.patch(
        &mut session,
        &int_key(1),
        &json!({"title": "Half Applied", "tracks": [{"bytes": "TEST"}]}),
    );
    assert!(matches!(err, Err(Error::Unprocessable { .. })));
    assert_eq!(
        session.get("Album", &int_key(1)).unwrap().unwrap()["title"],
        json!("For Those About To Rock We Salute You")
    );
}

#[test]
fn get_collection_applies_parsed_filters() {
    let (registry, session) = support::setup();
    let albums = Resource::new(&registry, "albums").unwrap();
    let params = [
        ("album_id-lt".to_string(), resourcery::ParamValue::from("10")),
        (
            "query".to_string(),
            resourcery::ParamValue::from(r#"{"title": "Big Ones"}"#),
        ),
    ]
    .into_iter()
    .collect();
    let filters = QueryParamParser::new(Some(&params))
        .parse_filters(albums.model.as_ref())
        .unwrap();
    let query = CollectionQuery {
        filters,
        ..CollectionQuery::default()
    };
    let result = albums.get_collection(&session, &query, None, true).unwrap();
    let rows = result.as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["album_id"], json!(5));
}

#[test]
fn get_collection_unfiltered_returns_everything() {
    let (registry, session) = support::setup();
    let albums = Resource::new(&registry, "albums").unwrap();
    let result = albums
        .get_collection(&session, &CollectionQuery::default(), None, true)
        .unwrap();
    assert_eq!(result.as_array().unwrap().len(), support::ALBUM_COUNT as usize);
}

#[test]
fn post_single_object_returns_the_dump() {
    let (registry, mut session) = support::setup();
    let artists = Resource::new(&registry, "artists").unwrap();
    let result = artists
        .post(&mut session, &json!({"artist_id": 500, "name": "Posted"}))
        .unwrap();
    assert_eq!(result.unwrap()["name"], json!("Posted"));
}

#[test]
fn post_list_returns_none() {
    let (registry, mut session) = support::setup();
    let artists = Resource::new(&registry, "artists").unwrap();
    let result = artists
        .post(
            &mut session,
            &json!([
                {"artist_id": 500, "name": "Posted A"},
                {"artist_id": 501, "name": "Posted B"}
            ]),
        )
        .unwrap();
    assert!(result.is_none());
    assert!(session.get("Artist", &int_key(501)).unwrap().is_some());
}

#[test]
fn post_invalid_object_is_unprocessable() {
    let (registry, mut session) = support::setup();
    let tracks = Resource::new(&registry, "tracks").unwrap();
    let err = tracks.post(
        &mut session,
        &json!({
            "track_id": "ERROR",
            "name": "Broken",
            "milliseconds": 1,
            "unit_price": 0.99
        }),
    );
    assert!(matches!(err, Err(Error::Unprocessable { .. })));
}

#[test]
fn put_requires_the_full_document() {
    let (registry, mut session) = support::setup();
    let tracks = Resource::new(&registry, "tracks").unwrap();

    let err = tracks.put(&mut session, &int_key(1), &json!({"name": "Only A Name"}));
    assert!(matches!(err, Err(Error::Unprocessable { .. })));

    let result = tracks
        .put(
            &mut session,
            &int_key(1),
            &json!({
                "track_id": 1,
                "name": "For Those About To Rock (We Salute You)",
                "composer": "Angus Young, Malcolm Young, Brian Johnson",
                "milliseconds": 4_000_000,
                "bytes": 11_170_334,
                "unit_price": 0.99
            }),
        )
        .unwrap();
    assert_eq!(result["milliseconds"], json!(4_000_000));
}

#[test]
fn delete_removes_the_row() {
    let (registry, mut session) = support::setup();
    let playlists = Resource::new(&registry, "playlists").unwrap();
    playlists.delete(&mut session, &int_key(18)).unwrap();
    assert!(session.get("Playlist", &int_key(18)).unwrap().is_none());

    let err = playlists.delete(&mut session, &int_key(18));
    assert!(matches!(err, Err(Error::NotFound { .. })));
}

#[test]
fn attr_operations_validate_through_the_field() {
    let (registry, mut session) = support::setup();
    let tracks = Resource::new(&registry, "tracks").unwrap();

    assert_eq!(
        tracks.get_attr(&session, &int_key(14), "name").unwrap(),
        json!("Spellbound")
    );

    let set = tracks.post_attr(&mut session, &int_key(14), "bytes", &json!(1)).unwrap();
    assert_eq!(set, json!(1));
    assert_eq!(
        session.get("Track", &int_key(14)).unwrap().unwrap()["bytes"],
        json!(1)
    );

    let err = tracks.post_attr(&mut session, &int_key(14), "bytes", &json!("BAD"));
    assert!(matches!(err, Err(Error::Unprocessable { .. })));

    let err = tracks.get_attr(&session, &int_key(14), "dne");
    assert!(matches!(err, Err(Error::NotFound { .. })));
}

#[test]
fn get_missing_row_is_not_found() {
    let (registry, session) = support::setup();
    let albums = Resource::new(&registry, "albums").unwrap();
    let err = albums.get(&session, &int_key(1_000_000), &[], true);
    assert!(matches!(err, Err(Error::NotFound { .. })));
}

#[test]
fn scoped_collection_queries_stay_inside_the_relationship() {
    let (registry, session) = support::setup();
    let tracks = Resource::new(&registry, "tracks").unwrap();
    let albums = Resource::new(&registry, "albums").unwrap();
    let scope = albums.relation_scope(&int_key(1), "tracks");
    let result = tracks
        .get_collection(&session, &CollectionQuery::default(), Some(scope), true)
        .unwrap();
    let rows = result.as_array().unwrap();
    assert_eq!(rows.len(), support::ALBUM_ONE_TRACKS.len());
    assert!(rows.iter().all(|row| row["track_id"] != json!(597)));
}
