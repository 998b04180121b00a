//! Informational page served to browsers that open the endpoint directly.

const TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>Marketplace Account Deletion Endpoint</title>
</head>
<body>
<h1>Marketplace Account Deletion Endpoint</h1>
<p>This endpoint receives marketplace account-deletion notifications for the
collection app and answers the platform's ownership challenge.</p>
<ul>
<li><code>GET ?challenge_code=...</code> returns the ownership digest as JSON</li>
<li><code>POST</code> with a deletion notification returns <code>{"status": "received"}</code></li>
</ul>
<p>Registered endpoint: <code>{{endpoint}}</code></p>
</body>
</html>
"#;

/// Render the page, showing the registered URL when one is configured.
pub fn render(endpoint_url: Option<&str>) -> String {
    let endpoint = endpoint_url
        .map(escape)
        .unwrap_or_else(|| "not configured".to_string());
    TEMPLATE.replace("{{endpoint}}", &endpoint)
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
