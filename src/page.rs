use crate::directory::ProxyEndpoint;
use crate::uri::{Protocol, flag_emoji, generate};

pub const PROXIES_PER_PAGE: usize = 20;

pub fn page_count(total: usize) -> usize {
    total.div_ceil(PROXIES_PER_PAGE).max(1)
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

fn card(host: &str, session_id: &str, proxy: &ProxyEndpoint, ordinal: usize) -> String {
    let buttons = [
        (Protocol::Vless, "VLESS TLS", "vless"),
        (Protocol::Trojan, "Trojan TLS", "trojan"),
    ]
    .iter()
    .map(|(protocol, title, class)| {
        let link = generate(*protocol, host, 443, session_id, proxy, ordinal);
        format!(
            r#"<button class="copy {class}" data-link="{link}" onclick="copyLink(this)">Copy {title}</button>"#,
            link = escape_html(&link),
        )
    })
    .collect::<Vec<_>>()
    .join("\n      ");

    format!(
        r#"<div class="card">
    <div class="head">
      <h3>{flag} {country}</h3>
      <span class="org">{org}</span>
    </div>
    <p class="addr">{ip}:{port}</p>
    <div class="links">
      {buttons}
    </div>
  </div>"#,
        flag = flag_emoji(&proxy.country),
        country = escape_html(&proxy.country),
        org = escape_html(&proxy.org),
        ip = escape_html(&proxy.ip),
        port = escape_html(&proxy.port),
    )
}

/// Render one page of the proxy directory. Pages are zero-based; a page past
/// the end renders without cards.
pub fn render_page(
    service_name: &str,
    host: &str,
    session_id: &str,
    proxies: &[ProxyEndpoint],
    page: usize,
) -> String {
    let total_pages = page_count(proxies.len());
    let start = page.saturating_mul(PROXIES_PER_PAGE).min(proxies.len());
    let end = (start + PROXIES_PER_PAGE).min(proxies.len());

    let cards = proxies[start..end]
        .iter()
        .enumerate()
        .map(|(i, proxy)| card(host, session_id, proxy, start + i + 1))
        .collect::<Vec<_>>()
        .join("\n  ");

    let mut nav = Vec::new();
    if page > 0 {
        // past the end, "previous" goes back to the last real page
        let previous = (page - 1).min(total_pages - 1);
        nav.push(format!(r#"<a href="/sub/{}">&larr; Previous</a>"#, previous));
    }
    if page.saturating_add(1) < total_pages {
        nav.push(format!(r#"<a href="/sub/{}">Next &rarr;</a>"#, page + 1));
    }

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="UTF-8" />
  <meta name="viewport" content="width=device-width, initial-scale=1.0" />
  <title>{service}</title>
  <style>
    body {{ background: #0f172a; color: #f8fafc; font-family: 'Segoe UI', sans-serif; padding: 2rem; }}
    h1 {{ text-align: center; color: #4ade80; }}
    .summary {{ text-align: center; margin-bottom: 2rem; }}
    .grid {{ display: grid; grid-template-columns: repeat(auto-fill, minmax(320px, 1fr)); gap: 1rem; }}
    .card {{ background: #1e293b; border-radius: 0.75rem; padding: 1rem; }}
    .head {{ display: flex; justify-content: space-between; align-items: center; }}
    .org {{ background: #334155; padding: 0.25rem 0.75rem; border-radius: 0.375rem; }}
    .addr {{ color: #cbd5e1; }}
    .copy {{ width: 100%; margin-top: 0.5rem; padding: 0.5rem; border: none; border-radius: 0.375rem; color: white; cursor: pointer; }}
    .vless {{ background: #2563eb; }}
    .trojan {{ background: #9333ea; }}
    nav {{ display: flex; justify-content: center; gap: 1rem; margin: 2rem 0; }}
    nav a, footer a {{ color: #4ade80; }}
    footer {{ text-align: center; color: #94a3b8; }}
  </style>
</head>
<body>
  <h1>{service}</h1>
  <p class="summary">Host: {host} | Proxies: {total} | Page: {current}/{total_pages}</p>
  <div class="grid">
  {cards}
  </div>
  <nav>{nav}</nav>
  <footer><a href="/api/v1/sub?format=clash">Download Clash config</a></footer>
  <script>
    async function copyLink(btn) {{
      const link = btn.dataset.link;
      try {{
        await navigator.clipboard.writeText(link);
        btn.textContent = 'Copied!';
      }} catch (err) {{
        prompt('Copy this config:', link);
      }}
    }}
  </script>
</body>
</html>"#,
        service = escape_html(service_name),
        host = escape_html(host),
        total = proxies.len(),
        current = page.saturating_add(1),
        nav = nav.join(""),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::parse_feed;

    fn directory(n: usize) -> Vec<ProxyEndpoint> {
        let feed: String = (0..n).map(|i| format!("10.0.0.{i},443,US,Org{i}\n")).collect();
        parse_feed(&feed)
    }

    #[test]
    fn counts_pages() {
        assert_eq!(page_count(0), 1);
        assert_eq!(page_count(20), 1);
        assert_eq!(page_count(21), 2);
    }

    #[test]
    fn first_page_links_forward_only() {
        let html = render_page("gw", "gw.example.com", "id", &directory(25), 0);
        assert_eq!(html.matches(r#"<div class="card">"#).count(), 20);
        assert!(html.contains("Page: 1/2"));
        assert!(html.contains(r#"href="/sub/1""#));
        assert!(!html.contains("Previous"));
        assert!(html.contains("vless://id@gw.example.com:443?"));
    }

    #[test]
    fn last_page_links_back_only() {
        let html = render_page("gw", "gw.example.com", "id", &directory(25), 1);
        assert_eq!(html.matches(r#"<div class="card">"#).count(), 5);
        assert!(html.contains(r#"href="/sub/0""#));
        assert!(!html.contains("Next"));
        assert!(html.contains("10.0.0.24:443"));
    }

    #[test]
    fn out_of_range_page_is_empty() {
        let html = render_page("gw", "h", "id", &directory(3), 9);
        assert_eq!(html.matches(r#"<div class="card">"#).count(), 0);
    }

    #[test]
    fn huge_page_number_does_not_overflow() {
        let html = render_page("gw", "h", "id", &directory(1), usize::MAX);
        assert_eq!(html.matches(r#"<div class="card">"#).count(), 0);
        assert!(html.contains(r#"<a href="/sub/0">&larr; Previous</a>"#));
        assert!(!html.contains("Next"));
        assert!(html.contains(&format!("Page: {}/1", usize::MAX)));
    }

    #[test]
    fn feed_text_is_escaped() {
        let proxies = parse_feed("1.1.1.1,443,US,<script>alert(1)</script>\n");
        let html = render_page("gw", "h", "id", &proxies, 0);
        assert!(!html.contains("<script>alert"));
        assert!(html.contains("&lt;script&gt;alert(1)&lt;/script&gt;"));
    }
}
