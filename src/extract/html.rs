//! Visible-text extraction from HTML
//!
//! Drops `<script>` and `<style>` subtrees and comments, inserts newlines
//! at block-element boundaries, and decodes the common entities. A small
//! state machine is enough here; no DOM is built.

const BLOCK_TAGS: &[&str] = &[
    "p", "div", "br", "hr", "li", "ul", "ol", "tr", "table", "h1", "h2", "h3", "h4", "h5", "h6",
    "section", "article", "header", "footer", "blockquote", "pre",
];

pub fn extract(bytes: &[u8]) -> String {
    let html = String::from_utf8_lossy(bytes);
    visible_text(&html)
}

fn tag_name(tag: &str) -> String {
    tag.trim_start_matches('/')
        .split(|c: char| c.is_whitespace() || c == '/' || c == '>')
        .next()
        .unwrap_or("")
        .to_lowercase()
}

pub fn visible_text(html: &str) -> String {
    let mut out = String::new();
    let mut rest = html;

    while let Some(lt) = rest.find('<') {
        push_text(&mut out, &rest[..lt]);
        rest = &rest[lt..];

        if rest.starts_with("<!--") {
            rest = match rest.find("-->") {
                Some(end) => &rest[end + 3..],
                None => "",
            };
            continue;
        }

        let Some(gt) = rest.find('>') else { break };
        let tag_body = &rest[1..gt];
        let name = tag_name(tag_body);
        rest = &rest[gt + 1..];

        if !tag_body.starts_with('/') && (name == "script" || name == "style") {
            // Skip the whole subtree
            let close = format!("</{}", name);
            rest = match find_ascii_ci(rest, &close) {
                Some(pos) => {
                    let after = &rest[pos..];
                    match after.find('>') {
                        Some(end) => &rest[pos + end + 1..],
                        None => "",
                    }
                }
                None => "",
            };
            continue;
        }

        if BLOCK_TAGS.contains(&name.as_str()) && !out.ends_with('\n') {
            out.push('\n');
        }
    }
    push_text(&mut out, rest);

    // Collapse whitespace-only lines
    let lines: Vec<&str> = out.lines().map(|l| l.trim()).filter(|l| !l.is_empty()).collect();
    lines.join("\n")
}

/// ASCII case-insensitive byte search. The needle starts with `<`, so a
/// match is always on a char boundary.
fn find_ascii_ci(haystack: &str, needle: &str) -> Option<usize> {
    let h = haystack.as_bytes();
    let n = needle.as_bytes();
    if n.is_empty() || h.len() < n.len() {
        return None;
    }
    (0..=h.len() - n.len()).find(|&i| h[i..i + n.len()].eq_ignore_ascii_case(n))
}

fn push_text(out: &mut String, raw: &str) {
    if raw.is_empty() {
        return;
    }
    out.push_str(&decode_entities(raw));
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_script_and_style() {
        let html = r#"<html><head><style>body { color: red }</style>
            <script type="text/javascript">alert("hi");</script></head>
            <body><p>正文内容</p></body></html>"#;
        let text = extract(html.as_bytes());
        assert_eq!(text, "正文内容");
    }

    #[test]
    fn test_block_boundaries_become_newlines() {
        let html = "<div>第一行</div><div>第二行</div><span>同行</span>";
        let text = extract(html.as_bytes());
        assert_eq!(text, "第一行\n第二行同行");
    }

    #[test]
    fn test_entities_decoded() {
        let html = "<p>a &lt; b &amp;&amp; c &gt; d</p>";
        assert_eq!(extract(html.as_bytes()), "a < b && c > d");
    }

    #[test]
    fn test_comments_dropped() {
        let html = "<p>before</p><!-- hidden --><p>after</p>";
        let text = extract(html.as_bytes());
        assert!(text.contains("before"));
        assert!(text.contains("after"));
        assert!(!text.contains("hidden"));
    }

    #[test]
    fn test_unclosed_script_fails_soft() {
        let html = "<p>visible</p><script>never closed";
        assert_eq!(extract(html.as_bytes()), "visible");
    }
}
