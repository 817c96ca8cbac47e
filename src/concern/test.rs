use std::time::Duration;

use pretty_assertions::assert_eq;

use crate::{
    bson::{doc, Bson},
    options::{Acknowledgment, WriteConcern},
};

#[test]
fn write_concern_is_acknowledged() {
    let w_1 = WriteConcern::builder()
        .w(Acknowledgment::Nodes(1))
        .journal(false)
        .build();
    assert!(w_1.is_acknowledged());

    let w_majority = WriteConcern::builder()
        .w(Acknowledgment::Majority)
        .journal(false)
        .build();
    assert!(w_majority.is_acknowledged());

    let w_0 = WriteConcern::builder()
        .w(Acknowledgment::Nodes(0))
        .journal(false)
        .build();
    assert!(!w_0.is_acknowledged());

    let w_0 = WriteConcern::builder().w(Acknowledgment::Nodes(0)).build();
    assert!(!w_0.is_acknowledged());

    let empty = WriteConcern::builder().build();
    assert!(empty.is_acknowledged());
    assert!(empty.is_empty());

    let empty = WriteConcern::builder().journal(true).build();
    assert!(empty.is_acknowledged());
    assert!(!empty.is_empty());
}

#[test]
fn write_concern_deserialize() {
    let w_1 = doc! { "w": 1 };
    let wc: WriteConcern = crate::bson::from_bson(Bson::Document(w_1)).unwrap();
    assert_eq!(wc, WriteConcern::nodes(1));

    let w_majority = doc! { "w": "majority" };
    let wc: WriteConcern = crate::bson::from_bson(Bson::Document(w_majority)).unwrap();
    assert_eq!(wc, WriteConcern::majority());

    let w_timeout = doc! { "w": "majority", "wtimeout": 100 };
    let wc: WriteConcern = crate::bson::from_bson(Bson::Document(w_timeout)).unwrap();
    assert_eq!(
        wc,
        WriteConcern {
            w: Acknowledgment::Majority.into(),
            w_timeout: Duration::from_millis(100).into(),
            journal: None
        }
    );

    let journal = doc! { "w": "tagged", "j": true };
    let wc: WriteConcern = crate::bson::from_bson(Bson::Document(journal)).unwrap();
    assert_eq!(
        wc,
        WriteConcern {
            w: Acknowledgment::Custom("tagged".to_string()).into(),
            w_timeout: None,
            journal: true.into()
        }
    );
}

#[test]
fn write_concern_serialize() {
    let wc = WriteConcern::builder()
        .w(Acknowledgment::Majority)
        .w_timeout(Duration::from_millis(250))
        .journal(true)
        .build();
    assert_eq!(
        crate::bson::to_document(&wc).unwrap(),
        doc! { "w": "majority", "wtimeout": 250, "j": true }
    );

    assert_eq!(
        crate::bson::to_document(&WriteConcern::nodes(2)).unwrap(),
        doc! { "w": 2 }
    );
}

#[test]
fn inconsistent_write_concern_rejected() {
    let wc = WriteConcern {
        w: Acknowledgment::Nodes(0).into(),
        journal: true.into(),
        w_timeout: None,
    };
    assert!(wc.validate().unwrap_err().is_invalid_argument());
    assert!(WriteConcern::majority().validate().is_ok());
}
