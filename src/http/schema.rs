//! Per-language schema rendering for the `schema`/`schema.<lang>` routes.

use crate::types::Signature;

/// Renders `signature` for `lang`. `None` is the bare top-level schema
/// object; `Some("simple")` is the compact form the replication follower
/// negotiates with (`{type_id, entry_name, namespace_name}`); `Some("h")`
/// and `Some("fs")` are illustrative source-level renderings. An unknown
/// language is `Err(())`, mapped to 404 by the caller.
pub fn render(signature: &Signature, lang: Option<&str>) -> Result<String, ()> {
    match lang {
        None => Ok(serde_json::to_string_pretty(signature).expect("Signature always serializes")),
        Some("simple") => Ok(serde_json::to_string(&serde_json::json!({
            "type_id": signature.schema_info.type_id,
            "entry_name": signature.entry_name,
            "namespace_name": signature.namespace_name,
        }))
        .expect("simple schema always serializes")),
        Some("h") => Ok(render_cpp_struct(signature)),
        Some("fs") => Ok(render_fsharp_record(signature)),
        Some(_) => Err(()),
    }
}

fn render_cpp_struct(sig: &Signature) -> String {
    let mut out = format!("struct {} {{\n", sig.entry_name);
    for field in &sig.schema_info.fields {
        out.push_str(&format!("  {} {};\n", field.type_name, field.name));
    }
    out.push_str("};\n");
    out
}

fn render_fsharp_record(sig: &Signature) -> String {
    let mut out = format!("type {} = {{\n", sig.entry_name);
    for field in &sig.schema_info.fields {
        out.push_str(&format!("  {}: {}\n", field.name, field.type_name));
    }
    out.push_str("}\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SchemaInfo;

    fn sig() -> Signature {
        Signature::new("ns", "Ev", SchemaInfo::from_fields(&[("x", "i32")]))
    }

    #[test]
    fn simple_carries_namespace_entry_and_type_id() {
        let rendered = render(&sig(), Some("simple")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed["entry_name"], "Ev");
        assert_eq!(parsed["namespace_name"], "ns");
        assert!(parsed["type_id"].is_number());
    }

    #[test]
    fn unknown_language_is_rejected() {
        assert!(render(&sig(), Some("cobol")).is_err());
    }
}
