// src/canonical.rs - fixed-key-order JSON emission for hashing
//
// Consensus depends on byte-for-byte stable serialisation. We never
// route a transaction or block through a generic serialiser (which
// may reorder keys or normalise numbers); instead each object is
// rendered by an explicit field list in the order the wire format
// defines.
use num_bigint::BigUint;

/// One field of a canonical object, in emission order.
pub enum Field<'a> {
    Str(&'a str),
    OptStr(Option<&'a str>),
    Int(i64),
    BigUint(&'a BigUint),
    /// Pre-rendered JSON array/object text (e.g. nested transactions).
    Raw(String),
}

/// Render `fields` as a compact JSON object, skipping nothing: an
/// elided field simply isn't passed in, an absent field is `OptStr(None)`
/// which renders as `null`.
pub fn render_object(fields: &[(&str, Field)]) -> String {
    let mut out = String::from("{");
    for (i, (key, value)) in fields.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&serde_json::to_string(key).expect("string keys always serialise"));
        out.push(':');
        out.push_str(&render_value(value));
    }
    out.push('}');
    out
}

fn render_value(value: &Field) -> String {
    match value {
        Field::Str(s) => serde_json::to_string(s).expect("string values always serialise"),
        Field::OptStr(Some(s)) => serde_json::to_string(s).expect("string values always serialise"),
        Field::OptStr(None) => "null".to_string(),
        Field::Int(n) => n.to_string(),
        Field::BigUint(n) => n.to_string(),
        Field::Raw(text) => text.clone(),
    }
}

/// Render a list of already-canonicalised object strings as a JSON array.
pub fn render_array(items: &[String]) -> String {
    format!("[{}]", items.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_fixed_order_object() {
        let rendered = render_object(&[
            ("a", Field::Int(1)),
            ("b", Field::Str("x")),
            ("c", Field::OptStr(None)),
        ]);
        assert_eq!(rendered, r#"{"a":1,"b":"x","c":null}"#);
    }

    #[test]
    fn renders_array_of_objects() {
        let obj = render_object(&[("k", Field::Int(1))]);
        let arr = render_array(&[obj.clone(), obj]);
        assert_eq!(arr, r#"[{"k":1},{"k":1}]"#);
    }
}
