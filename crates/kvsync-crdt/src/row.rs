//! Row Projection (component C4): encodes typed row schemas onto CRDT
//! containers, and minimal-diff algorithms that keep nested collaborative
//! text/array containers converging without needless rewrites (§4.3).

use std::collections::HashMap;

use crate::runtime::mem::{MemArray, MemText};
use crate::runtime::{CrdtArray, CrdtText};

/// A plain scalar value, as stored for scalar/date fields and as the
/// element type of array cells.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    Str(String),
    Int(i64),
    Real(f64),
    Bool(bool),
    Null,
}

/// The schema-declared type of one row field (§3 "Entity: Row").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Scalar,
    /// A date-with-timezone value, encoded as a string; no different write
    /// path than `Scalar`, kept distinct for schema readability.
    Date,
    /// Collaborative rich text.
    Text,
    /// Collaborative ordered list of scalars.
    Array,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSchema {
    pub name: String,
    pub field_type: FieldType,
}

/// A code-defined row schema, used both to validate rows for
/// [`crate::table::Table::get_all_valid`] and to choose the write path for
/// each incoming field (§4.3). `PartialEq` backs the Workspace Client
/// Lifecycle's field-by-field schema merge (§4.8 point 2: "unchanged
/// fields are not re-written").
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowSchema {
    pub fields: Vec<FieldSchema>,
}

impl RowSchema {
    pub fn new(fields: Vec<FieldSchema>) -> Self {
        Self { fields }
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// A single cell in a row's CRDT map. Composite cells (`Text`, `Array`) are
/// nested CRDT containers, not plain values (§3).
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Scalar(ScalarValue),
    Text(MemText),
    Array(MemArray<ScalarValue>),
}

impl Cell {
    fn matches(&self, field_type: FieldType) -> bool {
        matches!(
            (self, field_type),
            (Cell::Scalar(_), FieldType::Scalar)
                | (Cell::Scalar(_), FieldType::Date)
                | (Cell::Text(_), FieldType::Text)
                | (Cell::Array(_), FieldType::Array)
        )
    }
}

/// The incoming plain value for one field, as a caller supplies it to
/// [`apply_field`] — before projection decides whether it becomes a plain
/// overwrite or a diff update against an existing composite cell.
#[derive(Debug, Clone)]
pub enum InputValue {
    Scalar(ScalarValue),
    Array(Vec<ScalarValue>),
}

/// A row: a CRDT map from field name to [`Cell`] (§3 "Entity: Row").
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    cells: HashMap<String, Cell>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, field: &str) -> Option<&Cell> {
        self.cells.get(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &Cell)> {
        self.cells.iter()
    }

    /// Whether every cell the schema names type-checks, and every cell
    /// present type-checks against its declared type if the schema names
    /// it (unknown keys, preserved as scalars per §4.3, don't affect
    /// validity).
    pub fn is_valid(&self, schema: &RowSchema) -> bool {
        for field in &schema.fields {
            if let Some(cell) = self.cells.get(&field.name) {
                if !cell.matches(field.field_type) {
                    return false;
                }
            }
        }
        true
    }
}

/// Apply one incoming field write to `row`, following the cell-encoding
/// rules in §4.3:
/// - scalar/date → store as-is.
/// - schema says `Text` and the input is a string → diff-update the
///   existing `CrdtText`, or construct one and insert the whole string.
/// - input is an array → diff-update the existing `CrdtArray`, or
///   construct one and push every element.
/// - field undefined in the schema → preserved as a scalar if the input
///   is a scalar; arrays with no schema slot are skipped (no write), since
///   there is no composite container to project them onto.
pub fn apply_field(row: &mut Row, schema: &RowSchema, field: &str, input: InputValue) {
    match schema.field(field) {
        None => {
            if let InputValue::Scalar(value) = input {
                row.cells.insert(field.to_string(), Cell::Scalar(value));
            }
        }
        Some(field_schema) => match (field_schema.field_type, input) {
            (FieldType::Scalar, InputValue::Scalar(value))
            | (FieldType::Date, InputValue::Scalar(value)) => {
                row.cells.insert(field.to_string(), Cell::Scalar(value));
            }
            (FieldType::Text, InputValue::Scalar(ScalarValue::Str(target))) => {
                match row.cells.get_mut(field) {
                    Some(Cell::Text(text)) => diff_text(text, &target),
                    _ => {
                        let mut text = MemText::new(String::new());
                        diff_text(&mut text, &target);
                        row.cells.insert(field.to_string(), Cell::Text(text));
                    }
                }
            }
            (FieldType::Array, InputValue::Array(target)) => match row.cells.get_mut(field) {
                Some(Cell::Array(array)) => diff_array(array, &target),
                _ => {
                    let mut array = MemArray::new(Vec::new());
                    diff_array(&mut array, &target);
                    row.cells.insert(field.to_string(), Cell::Array(array));
                }
            },
            // Type mismatch between schema and input: no write (§4.3 "Undefined → skip").
            _ => {}
        },
    }
}

/// Minimal character-level text diff (§4.3.1). Common prefix and suffix are
/// left untouched; only the differing middle span is deleted/inserted, so
/// collaborative cursors anchored outside the changed span are not
/// disturbed.
pub fn diff_text(text: &mut dyn CrdtText, target: &str) {
    let current = text.to_string_value();
    if current == target {
        return;
    }
    let cur: Vec<char> = current.chars().collect();
    let tgt: Vec<char> = target.chars().collect();

    let mut prefix = 0;
    while prefix < cur.len() && prefix < tgt.len() && cur[prefix] == tgt[prefix] {
        prefix += 1;
    }
    let mut suffix = 0;
    while suffix < cur.len() - prefix
        && suffix < tgt.len() - prefix
        && cur[cur.len() - 1 - suffix] == tgt[tgt.len() - 1 - suffix]
    {
        suffix += 1;
    }

    let del_len = cur.len() - prefix - suffix;
    if del_len > 0 {
        text.delete(prefix, del_len);
    }
    let insert: String = tgt[prefix..tgt.len() - suffix].iter().collect();
    if !insert.is_empty() {
        text.insert(prefix, &insert);
    }
}

/// Minimal array diff (§4.3.2): a left-to-right walk that advances on
/// matching elements, inserts/deletes the remaining tail when one side is
/// exhausted, and on mismatch searches forward in the target for the
/// current element to decide between an insertion span and a deletion.
/// Converges to `target`; does not guarantee minimality across reorders
/// (stated limitation).
pub fn diff_array<T: Clone + PartialEq>(array: &mut dyn CrdtArray<T>, target: &[T]) {
    let current = array.to_vec_value();
    let mut cursor = 0;
    let mut ci = 0;
    let mut ti = 0;

    loop {
        if ci >= current.len() && ti >= target.len() {
            break;
        }
        if ci >= current.len() {
            let rest = &target[ti..];
            array.insert(cursor, rest);
            break;
        }
        if ti >= target.len() {
            array.delete(cursor, current.len() - ci);
            break;
        }
        if current[ci] == target[ti] {
            cursor += 1;
            ci += 1;
            ti += 1;
            continue;
        }
        match target[ti..].iter().position(|x| *x == current[ci]) {
            Some(offset) => {
                let span = &target[ti..ti + offset];
                if !span.is_empty() {
                    array.insert(cursor, span);
                    cursor += span.len();
                }
                ti += offset;
                cursor += 1;
                ci += 1;
                ti += 1;
            }
            None => {
                array.delete(cursor, 1);
                ci += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s4_text_minimal_diff_inserts_single_span() {
        let mut text = MemText::new("Hello World");
        diff_text(&mut text, "Hello Beautiful World");
        assert_eq!(text.to_string_value(), "Hello Beautiful World");
    }

    #[test]
    fn text_diff_equal_strings_is_a_no_op() {
        let mut text = MemText::new("same");
        diff_text(&mut text, "same");
        assert_eq!(text.to_string_value(), "same");
    }

    #[test]
    fn text_diff_handles_full_replacement() {
        let mut text = MemText::new("abc");
        diff_text(&mut text, "xyz");
        assert_eq!(text.to_string_value(), "xyz");
    }

    #[test]
    fn s5_array_minimal_diff_inserts_single_element() {
        let mut array = MemArray::new(vec!["typescript", "javascript"]);
        diff_array(&mut array, &["typescript", "svelte", "javascript"]);
        assert_eq!(
            array.to_vec_value(),
            vec!["typescript", "svelte", "javascript"]
        );
    }

    #[test]
    fn array_diff_deletes_removed_element() {
        let mut array = MemArray::new(vec!["a", "b", "c"]);
        diff_array(&mut array, &["a", "c"]);
        assert_eq!(array.to_vec_value(), vec!["a", "c"]);
    }

    #[test]
    fn array_diff_converges_on_reorder() {
        let mut array = MemArray::new(vec!["a", "b", "c"]);
        diff_array(&mut array, &["c", "a", "b"]);
        assert_eq!(array.to_vec_value(), vec!["c", "a", "b"]);
    }

    #[test]
    fn apply_field_constructs_text_cell_on_first_write() {
        let schema = RowSchema::new(vec![FieldSchema {
            name: "title".to_string(),
            field_type: FieldType::Text,
        }]);
        let mut row = Row::new();
        apply_field(
            &mut row,
            &schema,
            "title",
            InputValue::Scalar(ScalarValue::Str("hello".to_string())),
        );
        match row.get("title") {
            Some(Cell::Text(text)) => assert_eq!(text.to_string_value(), "hello"),
            other => panic!("expected Cell::Text, got {other:?}"),
        }
    }

    #[test]
    fn apply_field_diffs_existing_text_cell() {
        let schema = RowSchema::new(vec![FieldSchema {
            name: "title".to_string(),
            field_type: FieldType::Text,
        }]);
        let mut row = Row::new();
        apply_field(
            &mut row,
            &schema,
            "title",
            InputValue::Scalar(ScalarValue::Str("Hello World".to_string())),
        );
        apply_field(
            &mut row,
            &schema,
            "title",
            InputValue::Scalar(ScalarValue::Str("Hello Beautiful World".to_string())),
        );
        match row.get("title") {
            Some(Cell::Text(text)) => {
                assert_eq!(text.to_string_value(), "Hello Beautiful World")
            }
            other => panic!("expected Cell::Text, got {other:?}"),
        }
    }

    #[test]
    fn apply_field_preserves_unknown_scalar_key() {
        let schema = RowSchema::default();
        let mut row = Row::new();
        apply_field(
            &mut row,
            &schema,
            "extra",
            InputValue::Scalar(ScalarValue::Int(7)),
        );
        assert!(matches!(row.get("extra"), Some(Cell::Scalar(ScalarValue::Int(7)))));
    }

    #[test]
    fn is_valid_rejects_type_mismatch() {
        let schema = RowSchema::new(vec![FieldSchema {
            name: "views".to_string(),
            field_type: FieldType::Scalar,
        }]);
        let mut row = Row::new();
        row.cells
            .insert("views".to_string(), Cell::Text(MemText::new("oops")));
        assert!(!row.is_valid(&schema));
    }
}
