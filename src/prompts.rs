//! Externalized prompt templates.
//!
//! Templates live under `prompts/*.md` and are embedded at compile time.
//! Rendering substitutes only the placeholders named by the caller; every
//! other brace in a template (the JSON schema examples in particular) is
//! literal and passes through untouched.

/// Canonicalization prompt: `{series}`, `{cid}`, `{chunk_text}`.
pub const KG_CANONICALIZE: &str = include_str!("../prompts/kg_canonicalize.md");
/// Entity-linking multi-choice prompt: `{mention}`, `{candidates}`.
pub const EL_DISAMBIGUATE: &str = include_str!("../prompts/el_disambiguate.md");
/// Community summary prompt: `{level}`, `{members}`.
pub const COMM_SUMMARIZE: &str = include_str!("../prompts/comm_summarize.md");
/// QFS map prompt: `{query}`, `{summary}`.
pub const QFS_MAP: &str = include_str!("../prompts/qfs_map.md");
/// QFS reduce prompt: `{query}`, `{partials_block}`.
pub const QFS_REDUCE: &str = include_str!("../prompts/qfs_reduce.md");
/// PathRAG answer prompt: `{query}`, `{paths_block}`.
pub const PATH_ANSWER: &str = include_str!("../prompts/path_answer.md");
/// Vector answer prompt: `{query}`, `{chunks_block}`.
pub const VECTOR_ANSWER: &str = include_str!("../prompts/vector_answer.md");

/// Substitute `{key}` placeholders in a template.
///
/// Only the keys in `vars` are substituted; any `{...}` that does not match a
/// provided key stays literal, so templates can carry JSON examples without
/// escaping.
#[must_use]
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        let placeholder = format!("{{{key}}}");
        out = out.replace(&placeholder, value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_substitutes_placeholders() {
        let out = render("series={series} cid={cid}", &[("series", "s1"), ("cid", "c1")]);
        assert_eq!(out, "series=s1 cid=c1");
    }

    #[test]
    fn test_render_keeps_literal_braces() {
        let tpl = "Schema: { \"answer\": \"...\" }\nQ: {query}";
        let out = render(tpl, &[("query", "who?")]);
        assert!(out.contains("{ \"answer\": \"...\" }"));
        assert!(out.contains("Q: who?"));
    }

    #[test]
    fn test_templates_carry_their_placeholders() {
        assert!(KG_CANONICALIZE.contains("{series}"));
        assert!(KG_CANONICALIZE.contains("{chunk_text}"));
        assert!(QFS_MAP.contains("{summary}"));
        assert!(QFS_REDUCE.contains("{partials_block}"));
        assert!(PATH_ANSWER.contains("{paths_block}"));
        assert!(VECTOR_ANSWER.contains("{chunks_block}"));
        assert!(EL_DISAMBIGUATE.contains("{candidates}"));
        assert!(COMM_SUMMARIZE.contains("{members}"));
    }

    #[test]
    fn test_canonicalize_template_json_survives_render() {
        let out = render(
            KG_CANONICALIZE,
            &[("series", "s1"), ("cid", "c1"), ("chunk_text", "text")],
        );
        // The JSON schema example must still be present verbatim.
        assert!(out.contains("\"entities\""));
        assert!(out.contains("\"relations\""));
        assert!(!out.contains("{series}"));
    }
}
