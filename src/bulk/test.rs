use std::collections::HashMap;

use pretty_assertions::assert_eq;

use crate::{
    bson::{doc, Bson, Document},
    error::{BulkWriteError, Error, ErrorKind},
    options::{BulkWriteOptions, WriteConcern, WriteModel},
    test::mock_connection,
    BatchType,
    BulkWriteLimits,
    BulkWriteOperation,
    Namespace,
};

fn ns() -> Namespace {
    Namespace::new("db", "coll")
}

fn ordered() -> BulkWriteOperation {
    BulkWriteOperation::ordered(ns(), BulkWriteLimits::default(), None)
}

fn unordered() -> BulkWriteOperation {
    BulkWriteOperation::unordered(ns(), BulkWriteLimits::default(), None)
}

fn layout(bulk: &BulkWriteOperation) -> Vec<(BatchType, Vec<usize>)> {
    bulk.batches()
        .map(|batch| (batch.batch_type(), batch.original_indexes().to_vec()))
        .collect()
}

fn add_mixed(bulk: &mut BulkWriteOperation) {
    bulk.insert(doc! { "_id": 0 }).unwrap();
    bulk.insert(doc! { "_id": 1 }).unwrap();
    bulk.find(doc! { "_id": 0 })
        .update_one(doc! { "$set": { "x": 1 } })
        .unwrap();
    bulk.insert(doc! { "_id": 3 }).unwrap();
    bulk.find(doc! { "_id": 1 }).delete_one().unwrap();
}

fn bulk_write_error(error: Error) -> BulkWriteError {
    match *error.kind {
        ErrorKind::BulkWrite(bulk_write_error) => bulk_write_error,
        other => panic!("expected a bulk write error, got {other:?}"),
    }
}

fn command_name(command: &Document) -> String {
    command.keys().next().cloned().unwrap_or_default()
}

#[test]
fn ordered_groups_contiguous_statements() {
    let mut bulk = ordered();
    add_mixed(&mut bulk);

    assert_eq!(bulk.len(), 5);
    assert_eq!(
        layout(&bulk),
        vec![
            (BatchType::Insert, vec![0, 1]),
            (BatchType::Update, vec![2]),
            (BatchType::Insert, vec![3]),
            (BatchType::Delete, vec![4]),
        ]
    );
}

#[test]
fn unordered_groups_by_type() {
    let mut bulk = unordered();
    add_mixed(&mut bulk);

    assert_eq!(
        layout(&bulk),
        vec![
            (BatchType::Insert, vec![0, 1, 3]),
            (BatchType::Update, vec![2]),
            (BatchType::Delete, vec![4]),
        ]
    );
}

#[test]
fn batches_are_bounded_by_count() {
    let limits = BulkWriteLimits::new(16 * 1024 * 1024, 2, 48_000_000);
    let mut bulk = BulkWriteOperation::unordered(ns(), limits, None);
    for i in 0..5 {
        bulk.insert(doc! { "_id": i }).unwrap();
    }

    assert_eq!(
        layout(&bulk),
        vec![
            (BatchType::Insert, vec![0, 1]),
            (BatchType::Insert, vec![2, 3]),
            (BatchType::Insert, vec![4]),
        ]
    );
}

#[test]
fn batches_are_bounded_by_size() {
    // Each statement is 62 bytes and the payload bound is 100 bytes.
    let limits = BulkWriteLimits::new(16 * 1024 * 1024, 1000, 16_100);
    let mut bulk = BulkWriteOperation::ordered(ns(), limits, None);
    for i in 0..3 {
        bulk.insert(doc! { "_id": i, "s": "x".repeat(40) }).unwrap();
    }

    let sizes: Vec<_> = bulk.batches().map(|batch| batch.size_bytes()).collect();
    assert_eq!(sizes, vec![62, 62, 62]);
}

#[test]
fn oversized_statement_rejected() {
    let limits = BulkWriteLimits::new(50, 1000, 48_000_000);
    let mut bulk = BulkWriteOperation::ordered(ns(), limits, None);

    let error = bulk
        .insert(doc! { "_id": 0, "s": "x".repeat(40) })
        .unwrap_err();
    assert!(error.is_invalid_argument());
    assert!(bulk.is_empty());
    assert_eq!(bulk.batches().count(), 0);
}

#[test]
fn update_statements_get_headroom() {
    let limits = BulkWriteLimits::new(100, 1000, 48_000_000);
    let mut bulk = BulkWriteOperation::ordered(ns(), limits, None);

    // The update document alone is under 100 bytes; the statement wrapping it is not.
    let update = doc! { "$set": { "s": "x".repeat(60) } };
    bulk.find(doc! { "_id": 0 }).update_one(update).unwrap();
    bulk.find(doc! { "_id": 0 }).delete_one().unwrap();
    assert_eq!(bulk.len(), 2);
    assert!(bulk.batches().next().unwrap().size_bytes() > 100);

    let too_large = doc! { "$set": { "s": "x".repeat(16 * 1024) } };
    assert!(bulk
        .find(doc! { "_id": 0 })
        .update_one(too_large)
        .unwrap_err()
        .is_invalid_argument());
    assert!(bulk
        .insert(doc! { "_id": 1, "s": "x".repeat(100) })
        .unwrap_err()
        .is_invalid_argument());
    assert_eq!(bulk.len(), 2);
}

#[test]
fn invalid_statements_rejected() {
    let mut bulk = ordered();

    assert!(bulk
        .find(doc! {})
        .update_one(doc! { "x": 1 })
        .unwrap_err()
        .is_invalid_argument());
    assert!(bulk
        .find(doc! {})
        .replace_one(doc! { "$set": { "x": 1 } })
        .unwrap_err()
        .is_invalid_argument());
    assert!(bulk.is_empty());

    bulk.find(doc! {})
        .update(vec![doc! { "$set": { "x": 1 } }])
        .unwrap();
    bulk.find(doc! {}).replace_one(doc! { "x": 1 }).unwrap();
    assert_eq!(bulk.len(), 2);
}

#[tokio::test]
async fn empty_bulk_write_rejected() {
    let (mut conn, handle) = mock_connection(|_| doc! { "ok": 1 });

    let error = ordered().execute(&mut conn).await.unwrap_err();
    assert!(error.is_invalid_argument());
    drop(conn);

    assert!(handle.await.unwrap().is_empty());
}

#[tokio::test]
async fn unacknowledged_write_concern_rejected() {
    let (mut conn, _handle) = mock_connection(|_| doc! { "ok": 1 });

    let options = BulkWriteOptions::builder()
        .write_concern(WriteConcern::nodes(0))
        .build();
    let mut bulk = BulkWriteOperation::ordered(ns(), BulkWriteLimits::default(), options);
    bulk.insert(doc! { "_id": 0 }).unwrap();

    let error = bulk.execute(&mut conn).await.unwrap_err();
    assert!(error.is_invalid_argument());
}

#[tokio::test]
async fn ordered_execution() {
    let (mut conn, handle) = mock_connection(|command| match command_name(&command).as_str() {
        "insert" => doc! { "ok": 1, "n": 2 },
        "update" => doc! {
            "ok": 1,
            "n": 2,
            "nModified": 1,
            "upserted": [{ "index": 1, "_id": "upserted" }],
        },
        _ => doc! { "ok": 1, "n": 3 },
    });

    let mut bulk = ordered();
    bulk.insert(doc! { "_id": 1 }).unwrap();
    bulk.insert(doc! { "x": 2 }).unwrap();
    bulk.find(doc! { "x": 2 })
        .update_one(doc! { "$set": { "y": 1 } })
        .unwrap();
    bulk.find(doc! { "x": 3 })
        .upsert()
        .update_one(doc! { "$set": { "y": 1 } })
        .unwrap();
    bulk.find(doc! { "y": 1 }).delete().unwrap();

    let result = bulk.execute(&mut conn).await.unwrap();
    drop(conn);

    assert_eq!(result.inserted_count, 2);
    assert_eq!(result.matched_count, 1);
    assert_eq!(result.modified_count, 1);
    assert_eq!(result.upserted_count, 1);
    assert_eq!(result.deleted_count, 3);
    assert_eq!(
        result.upserted_ids,
        HashMap::from([(3, Bson::String("upserted".to_string()))])
    );
    assert_eq!(result.inserted_ids.len(), 2);
    assert_eq!(result.inserted_ids.get(&0), Some(&Bson::Int32(1)));
    assert!(matches!(result.inserted_ids.get(&1), Some(Bson::ObjectId(_))));

    let commands = handle.await.unwrap();
    let names: Vec<_> = commands.iter().map(command_name).collect();
    assert_eq!(names, vec!["insert", "update", "delete"]);

    let documents = commands[0].get_array("documents").unwrap();
    assert_eq!(commands[0].get_str("insert"), Ok("coll"));
    assert_eq!(commands[0].get_bool("ordered"), Ok(true));
    assert_eq!(commands[0].get_str("$db"), Ok("db"));
    assert_eq!(documents[0], Bson::Document(doc! { "_id": 1 }));
    assert_eq!(
        documents[1].as_document().unwrap().get("_id"),
        result.inserted_ids.get(&1)
    );

    assert_eq!(
        commands[1].get_array("updates").unwrap().clone(),
        vec![
            Bson::Document(doc! { "q": { "x": 2 }, "u": { "$set": { "y": 1 } }, "multi": false }),
            Bson::Document(doc! {
                "q": { "x": 3 },
                "u": { "$set": { "y": 1 } },
                "multi": false,
                "upsert": true,
            }),
        ]
    );
    assert_eq!(
        commands[2].get_array("deletes").unwrap().clone(),
        vec![Bson::Document(doc! { "q": { "y": 1 }, "limit": 0 })]
    );
}

#[tokio::test]
async fn ordered_execution_stops_at_write_error() {
    let (mut conn, handle) = mock_connection(|_| {
        doc! {
            "ok": 1,
            "n": 1,
            "writeErrors": [{ "index": 1, "code": 11000, "errmsg": "duplicate key" }],
        }
    });

    let mut bulk = ordered();
    bulk.insert(doc! { "_id": 0 }).unwrap();
    bulk.insert(doc! { "_id": 0 }).unwrap();
    bulk.insert(doc! { "_id": 1 }).unwrap();
    bulk.find(doc! { "_id": 1 }).delete_one().unwrap();

    let error = bulk_write_error(bulk.execute(&mut conn).await.unwrap_err());
    drop(conn);

    assert_eq!(error.write_errors.len(), 1);
    assert_eq!(error.write_errors[&1].code, 11000);
    assert_eq!(error.write_errors[&1].message, "duplicate key");
    let partial_result = error.partial_result.unwrap();
    assert_eq!(partial_result.inserted_count, 1);
    assert_eq!(
        partial_result.inserted_ids,
        HashMap::from([(0, Bson::Int32(0))])
    );

    assert_eq!(handle.await.unwrap().len(), 1);
}

#[tokio::test]
async fn unordered_execution_continues_past_write_errors() {
    let (mut conn, handle) = mock_connection(|command| match command_name(&command).as_str() {
        "insert" => doc! {
            "ok": 1,
            "n": 1,
            "writeErrors": [{ "index": 0, "code": 11000, "errmsg": "duplicate key" }],
        },
        _ => doc! { "ok": 1, "n": 1, "nModified": 1 },
    });

    let mut bulk = unordered();
    bulk.insert(doc! { "_id": 0 }).unwrap();
    bulk.find(doc! { "_id": 0 })
        .update(doc! { "$inc": { "x": 1 } })
        .unwrap();
    bulk.insert(doc! { "_id": 2 }).unwrap();
    assert!(!bulk.is_ordered());

    let error = bulk_write_error(bulk.execute(&mut conn).await.unwrap_err());
    drop(conn);

    assert_eq!(error.write_errors.keys().copied().collect::<Vec<_>>(), vec![0]);
    let partial_result = error.partial_result.unwrap();
    assert_eq!(partial_result.inserted_count, 1);
    assert_eq!(
        partial_result.inserted_ids,
        HashMap::from([(2, Bson::Int32(2))])
    );
    assert_eq!(partial_result.matched_count, 1);
    assert_eq!(partial_result.modified_count, 1);

    let commands = handle.await.unwrap();
    assert_eq!(commands.len(), 2);
    assert_eq!(commands[0].get_bool("ordered"), Ok(false));
    assert_eq!(
        commands[1].get_array("updates").unwrap()[0],
        Bson::Document(doc! { "q": { "_id": 0 }, "u": { "$inc": { "x": 1 } }, "multi": true })
    );
}

#[tokio::test]
async fn command_failure_is_a_write_error() {
    let (mut conn, handle) = mock_connection(|command| match command_name(&command).as_str() {
        "insert" => doc! { "ok": 1, "n": 1 },
        _ => doc! { "ok": 0, "code": 2, "codeName": "BadValue", "errmsg": "bad hint" },
    });

    let mut bulk = unordered();
    bulk.add(WriteModel::DeleteOne {
        filter: doc! { "x": 1 },
        collation: None,
        hint: Some(Bson::String("missing_index".to_string())),
    })
    .unwrap();
    bulk.insert(doc! { "_id": 1 }).unwrap();

    let error = bulk_write_error(bulk.execute(&mut conn).await.unwrap_err());
    drop(conn);

    assert_eq!(error.write_errors.len(), 1);
    assert_eq!(error.write_errors[&0].code, 2);
    assert_eq!(error.write_errors[&0].code_name.as_deref(), Some("BadValue"));
    assert_eq!(error.partial_result.unwrap().inserted_count, 1);

    let commands = handle.await.unwrap();
    let names: Vec<_> = commands.iter().map(command_name).collect();
    assert_eq!(names, vec!["insert", "delete"]);
    assert_eq!(
        commands[1].get_array("deletes").unwrap()[0],
        Bson::Document(doc! { "q": { "x": 1 }, "limit": 1, "hint": "missing_index" })
    );
}

#[tokio::test]
async fn write_concern_errors_are_reported() {
    let (mut conn, _handle) = mock_connection(|_| {
        doc! {
            "ok": 1,
            "n": 1,
            "writeConcernError": { "code": 64, "codeName": "WriteConcernFailed", "errmsg": "waiting" },
        }
    });

    let mut bulk = ordered();
    bulk.insert(doc! { "_id": 0 }).unwrap();
    bulk.find(doc! { "_id": 0 }).delete_one().unwrap();

    let error = bulk_write_error(bulk.execute(&mut conn).await.unwrap_err());
    assert!(error.write_errors.is_empty());
    assert_eq!(error.write_concern_errors.len(), 2);
    assert_eq!(error.write_concern_errors[0].code, 64);

    let partial_result = error.partial_result.unwrap();
    assert_eq!(partial_result.inserted_count, 1);
    assert_eq!(partial_result.deleted_count, 1);
}

#[tokio::test]
async fn invalid_reply_aborts() {
    let (mut conn, handle) = mock_connection(|command| match command_name(&command).as_str() {
        "insert" => doc! { "ok": 1, "n": 1 },
        _ => doc! { "ok": 1, "n": "three" },
    });

    let mut bulk = unordered();
    bulk.insert(doc! { "_id": 0 }).unwrap();
    bulk.find(doc! {}).update(doc! { "$set": { "x": 1 } }).unwrap();
    bulk.find(doc! {}).delete().unwrap();

    let error = bulk.execute(&mut conn).await.unwrap_err();
    assert!(error.source.is_some());
    let error = bulk_write_error(error);
    assert!(error.write_errors.is_empty());
    assert_eq!(error.partial_result.unwrap().inserted_count, 1);
    drop(conn);

    assert_eq!(handle.await.unwrap().len(), 2);
}

#[tokio::test]
async fn options_are_sent_with_every_batch() {
    let (mut conn, handle) = mock_connection(|_| doc! { "ok": 1, "n": 1 });

    let options = BulkWriteOptions::builder()
        .bypass_document_validation(true)
        .comment(Bson::String("bulk".to_string()))
        .let_vars(doc! { "target": 1 })
        .write_concern(WriteConcern::majority())
        .build();
    let mut bulk = BulkWriteOperation::ordered(ns(), BulkWriteLimits::default(), options);
    bulk.insert(doc! { "_id": 0 }).unwrap();
    bulk.find(doc! { "$expr": { "$eq": ["$_id", "$$target"] } })
        .delete_one()
        .unwrap();
    bulk.execute(&mut conn).await.unwrap();
    drop(conn);

    for command in handle.await.unwrap() {
        assert_eq!(command.get_bool("bypassDocumentValidation"), Ok(true));
        assert_eq!(command.get_str("comment"), Ok("bulk"));
        assert_eq!(command.get_document("let"), Ok(&doc! { "target": 1 }));
        assert_eq!(
            command.get_document("writeConcern"),
            Ok(&doc! { "w": "majority" })
        );
    }
}

#[tokio::test]
async fn default_options_are_omitted() {
    let (mut conn, handle) = mock_connection(|_| doc! { "ok": 1, "n": 1 });

    let options = BulkWriteOptions::builder()
        .write_concern(WriteConcern::default())
        .build();
    let mut bulk = BulkWriteOperation::ordered(ns(), BulkWriteLimits::default(), options);
    bulk.insert(doc! { "_id": 0 }).unwrap();
    bulk.execute(&mut conn).await.unwrap();
    drop(conn);

    let commands = handle.await.unwrap();
    assert_eq!(
        commands[0],
        doc! {
            "insert": "coll",
            "ordered": true,
            "$db": "db",
            "documents": [{ "_id": 0 }],
        }
    );
}
