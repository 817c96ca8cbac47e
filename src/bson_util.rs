use std::io::{Read, Write};

use crate::{
    bson::{oid::ObjectId, Bson, Document, RawBsonRef},
    error::{Error, ErrorKind, Result},
};

/// Coerce numeric types into an `i64` if it would be lossless to do so. If this Bson is not numeric
/// or the conversion would be lossy (e.g. 1.5 -> 1), this returns `None`.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn get_int(val: &Bson) -> Option<i64> {
    match *val {
        Bson::Int32(i) => Some(i64::from(i)),
        Bson::Int64(i) => Some(i),
        Bson::Double(f) if (f - (f as i64 as f64)).abs() <= f64::EPSILON => Some(f as i64),
        _ => None,
    }
}

/// Coerce numeric types into an `i64` if it would be lossless to do so. If this Bson is not numeric
/// or the conversion would be lossy (e.g. 1.5 -> 1), this returns `None`.
pub(crate) fn get_int_raw(val: RawBsonRef<'_>) -> Option<i64> {
    match val {
        RawBsonRef::Int32(i) => get_int(&Bson::Int32(i)),
        RawBsonRef::Int64(i) => get_int(&Bson::Int64(i)),
        RawBsonRef::Double(i) => get_int(&Bson::Double(i)),
        _ => None,
    }
}

pub(crate) fn first_key(document: &Document) -> Option<&str> {
    document.keys().next().map(String::as_str)
}

pub(crate) fn replacement_document_check(replacement: &Document) -> Result<()> {
    match first_key(replacement) {
        Some(s) if s.starts_with('$') => Err(ErrorKind::InvalidArgument {
            message: "replace document must have first key not starting with '$'".to_string(),
        }
        .into()),
        _ => Ok(()),
    }
}

pub(crate) fn update_document_check(update: &Document) -> Result<()> {
    match first_key(update) {
        Some(s) if s.starts_with('$') => Ok(()),
        _ => Err(ErrorKind::InvalidArgument {
            message: "update document must have first key starting with '$'".to_string(),
        }
        .into()),
    }
}

/// Returns the document's `_id`, first prepending a freshly generated `ObjectId` if it has none.
pub(crate) fn get_or_prepend_id_field(document: &mut Document) -> Bson {
    if let Some(id) = document.get("_id") {
        return id.clone();
    }

    let id = Bson::ObjectId(ObjectId::new());
    let mut with_id = Document::new();
    with_id.insert("_id", id.clone());
    for (key, value) in std::mem::take(document) {
        with_id.insert(key, value);
    }
    *document = with_id;

    id
}

/// Read a document's raw BSON bytes from the provided reader.
pub(crate) fn read_document_bytes<R: Read>(mut reader: R) -> Result<Vec<u8>> {
    let mut length_bytes = [0u8; 4];
    reader.read_exact(&mut length_bytes)?;
    let length = i32::from_le_bytes(length_bytes);
    let length = u64::try_from(length)
        .ok()
        .filter(|length| *length >= 5)
        .ok_or_else(|| Error::invalid_response(format!("invalid document length: {length}")))?;

    let mut bytes = Vec::with_capacity(usize::try_from(length).unwrap_or_default());
    bytes.write_all(&length_bytes)?;

    reader.take(length - 4).read_to_end(&mut bytes)?;
    if bytes.len() as u64 != length {
        return Err(Error::invalid_response(
            "document length exceeds remaining message bytes",
        ));
    }

    Ok(bytes)
}

#[cfg(test)]
mod test {
    use crate::{
        bson::{doc, rawdoc, Bson},
        bson_util::{
            get_int,
            get_or_prepend_id_field,
            read_document_bytes,
            replacement_document_check,
            update_document_check,
        },
    };

    #[test]
    fn lossless_ints() {
        assert_eq!(get_int(&Bson::Int32(5)), Some(5));
        assert_eq!(get_int(&Bson::Double(7.0)), Some(7));
        assert_eq!(get_int(&Bson::Double(1.5)), None);
        assert_eq!(get_int(&Bson::String("1".into())), None);
    }

    #[test]
    fn prepended_ids() {
        let mut with_id = doc! { "x": 1, "_id": 7 };
        assert_eq!(get_or_prepend_id_field(&mut with_id), Bson::Int32(7));
        assert_eq!(with_id, doc! { "x": 1, "_id": 7 });

        let mut without_id = doc! { "x": 1 };
        let id = get_or_prepend_id_field(&mut without_id);
        assert!(matches!(id, Bson::ObjectId(_)));
        assert_eq!(without_id.keys().next().map(String::as_str), Some("_id"));
        assert_eq!(without_id.get("_id"), Some(&id));
        assert_eq!(without_id.get_i32("x"), Ok(1));
    }

    #[test]
    fn update_and_replacement_checks() {
        assert!(update_document_check(&doc! { "$set": { "x": 1 } }).is_ok());
        assert!(update_document_check(&doc! { "x": 1 }).is_err());
        assert!(update_document_check(&doc! {}).is_err());

        assert!(replacement_document_check(&doc! { "x": 1 }).is_ok());
        assert!(replacement_document_check(&doc! {}).is_ok());
        assert!(replacement_document_check(&doc! { "$set": { "x": 1 } }).is_err());
    }

    #[test]
    fn read_documents() {
        let first = rawdoc! { "a": 1 };
        let second = rawdoc! { "b": "two" };
        let mut bytes = first.as_bytes().to_vec();
        bytes.extend_from_slice(second.as_bytes());

        let mut reader = bytes.as_slice();
        assert_eq!(read_document_bytes(&mut reader).unwrap(), first.as_bytes());
        assert_eq!(read_document_bytes(&mut reader).unwrap(), second.as_bytes());
        assert!(read_document_bytes(&mut reader).is_err());

        let truncated = &first.as_bytes()[..first.as_bytes().len() - 1];
        assert!(read_document_bytes(truncated).is_err());
    }
}
