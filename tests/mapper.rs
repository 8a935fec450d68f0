use mongodb::bson::{Bson, doc, oid::ObjectId};
use remora::{
    Error, FieldDescriptor, FieldKind, IndexDefinition, Record, Schema, Value, reconcile,
};
use std::sync::{Arc, OnceLock};

fn line_item() -> Arc<Schema> {
    static SCHEMA: OnceLock<Arc<Schema>> = OnceLock::new();
    SCHEMA
        .get_or_init(|| {
            Schema::embedded("ItLineItem")
                .field(FieldDescriptor::new("sku", FieldKind::string()).required())
                .field(
                    FieldDescriptor::new("qty", FieldKind::int().with_int_bounds(Some(1), None))
                        .required(),
                )
                .register()
                .unwrap()
        })
        .clone()
}

fn order() -> Arc<Schema> {
    static SCHEMA: OnceLock<Arc<Schema>> = OnceLock::new();
    SCHEMA
        .get_or_init(|| {
            line_item();
            Schema::document("ItOrder")
                .collection("it_orders")
                .shard_key(["region"])
                .field(FieldDescriptor::new("region", FieldKind::string()).required())
                .field(
                    FieldDescriptor::new("status", FieldKind::string())
                        .choices(["open", "shipped"])
                        .default_value("open"),
                )
                .field(FieldDescriptor::new(
                    "items",
                    FieldKind::list(FieldKind::embedded("ItLineItem")),
                ))
                .field(FieldDescriptor::new(
                    "meta",
                    FieldKind::map(FieldKind::string()),
                ))
                .field(FieldDescriptor::new("note", FieldKind::string()).nullable())
                .index(IndexDefinition::parse("region:1").unwrap())
                .index(
                    IndexDefinition::parse("region:1,status:1")
                        .unwrap()
                        .unique()
                        .unwrap(),
                )
                .register()
                .unwrap()
        })
        .clone()
}

fn stored_order() -> Record {
    order()
        .load(doc! {
            "_id": ObjectId::new(),
            "region": "emea",
            "status": "open",
            "items": [
                { "sku": "a-1", "qty": 2 },
                { "sku": "b-2", "qty": 1 },
            ],
            "meta": { "source": "web" },
        })
        .unwrap()
}

#[test]
fn wire_round_trip_preserves_values_and_stays_clean() {
    let mut record = stored_order();
    let wire = record.to_wire(None).unwrap();
    let reloaded = order().load(wire.clone()).unwrap();

    assert_eq!(reloaded, record);
    assert!(reloaded.get_changed_fields().is_empty());
    assert!(!reloaded.is_new());

    // key order on the wire: identity first, then declaration order
    let keys: Vec<&str> = wire.keys().map(String::as_str).collect();
    assert_eq!(keys[0], "_id");
    assert!(keys.iter().position(|k| *k == "region") < keys.iter().position(|k| *k == "items"));
}

#[test]
fn nested_mutations_produce_minimal_paths() {
    let mut record = stored_order();

    record
        .get_mut("items")
        .and_then(Value::as_array_mut)
        .unwrap()
        .get_mut(1)
        .and_then(Value::as_record_mut)
        .unwrap()
        .set_serialized("qty", &5)
        .unwrap();
    record
        .get_mut("meta")
        .and_then(Value::as_map_mut)
        .unwrap()
        .insert("campaign", Value::from_bson(Bson::String("spring".into())));

    let mut changed = record.get_changed_fields();
    changed.sort();
    assert_eq!(changed, ["items.1.qty", "meta.campaign"]);

    // marking the parent collapses the leaf paths beneath it
    record.mark_changed("items");
    let mut changed = record.get_changed_fields();
    changed.sort();
    assert_eq!(changed, ["items", "meta.campaign"]);
}

#[test]
fn structural_list_changes_dirty_the_whole_field() {
    let mut record = stored_order();
    let item = line_item()
        .new_record(doc! { "sku": "c-3", "qty": 1 })
        .unwrap();
    record
        .get_mut("items")
        .and_then(Value::as_array_mut)
        .unwrap()
        .push(Value::Record(item));

    assert_eq!(record.get_changed_fields(), ["items"]);
}

#[test]
fn shard_key_reassignment_fails_only_when_persisted_and_different() {
    let mut fresh = order().new_record(doc! { "region": "emea" }).unwrap();
    fresh.set_serialized("region", &"apac").unwrap();

    let mut stored = stored_order();
    stored.set_serialized("region", &"emea").unwrap();
    let err = stored.set_serialized("region", &"apac").unwrap_err();
    assert!(matches!(err, Error::Operation(_)));
}

#[test]
fn projection_threads_into_nested_records() {
    let mut record = stored_order();
    let wire = record.to_wire(Some(&["items.sku", "region"])).unwrap();

    let keys: Vec<&str> = wire.keys().map(String::as_str).collect();
    assert_eq!(keys, ["_id", "region", "items"]);

    let items = wire.get_array("items").unwrap();
    for item in items {
        let item = item.as_document().unwrap();
        assert!(item.contains_key("sku"));
        assert!(!item.contains_key("qty"));
    }
}

#[test]
fn validation_reports_nested_failures_together() {
    let record = order()
        .new_record(doc! {
            "region": "emea",
            "status": "open",
            "items": [
                { "sku": "a-1", "qty": 0 },
                { "qty": 2 },
            ],
        })
        .unwrap();

    let err = record.validate().unwrap_err();
    let paths = err.to_paths();
    // both bad elements surface, keyed by index, in one error
    assert!(paths.keys().any(|p| p.starts_with("items.0")));
    assert!(paths.keys().any(|p| p.starts_with("items.1")));
}

#[test]
fn choices_and_nullable_semantics() {
    let mut record = order().new_record(doc! { "region": "emea" }).unwrap();
    assert_eq!(record.get("status").unwrap().as_str(), Some("open"));

    record.set_serialized("status", &"archived").unwrap();
    assert!(record.validate().is_err());
    record.set_serialized("status", &"shipped").unwrap();
    assert!(record.validate().is_ok());

    // nullable fields marshal as explicit nulls, absent ones are dropped
    let wire = record.to_wire(None).unwrap();
    assert_eq!(wire.get("note"), Some(&Bson::Null));
}

#[test]
fn json_round_trip_through_extended_json() {
    let mut record = stored_order();
    let json = record.to_json().unwrap();
    let reloaded = Record::from_json(&order(), &json, false).unwrap();
    assert_eq!(reloaded, record);
}

#[test]
fn polymorphic_hierarchy_round_trips_most_derived_type() {
    let base = Schema::document("ItEvent")
        .collection("it_events")
        .polymorphic()
        .field(FieldDescriptor::new("at", FieldKind::DateTime))
        .register()
        .unwrap();
    Schema::document("ItClickEvent")
        .extends(&base)
        .field(FieldDescriptor::new("target", FieldKind::string()))
        .register()
        .unwrap();

    let mut click = remora::schema::registry::get("ItClickEvent")
        .unwrap()
        .new_record(doc! { "at": "2024-04-01T08:00:00Z", "target": "cta" })
        .unwrap();
    let wire = click.to_wire(None).unwrap();
    assert_eq!(wire.get_str("_cls").unwrap(), "ItClickEvent");

    // loading through the base type restores the derived one
    let loaded = base.load(wire).unwrap();
    assert_eq!(loaded.type_name(), "ItClickEvent");
    assert!(loaded.schema().is_a("ItEvent"));
}

#[test]
fn declared_indexes_reconcile_against_live_state() {
    let schema = order();
    let live = Vec::new();
    let entries = reconcile(schema.indexes(), live).unwrap();

    // region_1 is a strict prefix of the compound index, so it is redundant;
    // the compound one is unique and therefore still needs building itself
    let region = entries
        .iter()
        .find(|e| e.definition().name() == "region_1")
        .unwrap();
    assert!(region.is_covered());
    assert!(!region.needs_build());

    let compound = entries
        .iter()
        .find(|e| e.definition().name() == "region_1_status_1")
        .unwrap();
    assert!(compound.definition().is_unique());
    assert!(compound.needs_build());

    // the forced identity index is declared but never built by us
    let id = entries
        .iter()
        .find(|e| e.definition().name() == "_id_1")
        .unwrap();
    assert!(!id.needs_build());
}
