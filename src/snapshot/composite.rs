//! Entries assembled from several section requests.

use futures::future::join_all;
use serde_json::{Map, Value};
use tracing::warn;

use super::{Section, SectionKind};
use crate::api::JsonSource;

impl SectionKind {
  /// Value used when the section's request fails.
  pub fn empty(self) -> Value {
    match self {
      SectionKind::Object => Value::Null,
      SectionKind::List => Value::Array(Vec::new()),
    }
  }
}

/// Fetch every section in parallel and assemble them into one object.
///
/// A failed section is replaced by its kind's empty value, so this never fails.
pub async fn assemble<S: JsonSource + ?Sized>(
  source: &S,
  key: &str,
  sections: &[Section],
) -> Value {
  let results = join_all(sections.iter().map(|s| source.get(&s.path))).await;

  let mut object = Map::with_capacity(sections.len());
  for (section, result) in sections.iter().zip(results) {
    let value = match result {
      Ok(response) => response.data,
      Err(e) => {
        warn!(key = %key, field = %section.field, error = %e, "section fetch failed");
        section.kind.empty()
      }
    };
    object.insert(section.field.clone(), value);
  }

  Value::Object(object)
}
