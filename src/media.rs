use std::borrow::Cow;
use std::collections::BTreeMap;

use scraper::{Html, Selector};

/// `src` values of every `<img>` in an HTML fragment, in document order.
///
/// Inline `data:` images carry their own bytes and are left out.
pub fn image_refs(html: &str) -> Vec<String> {
    let Ok(selector) = Selector::parse("img[src]") else {
        return Vec::new();
    };
    let fragment = Html::parse_fragment(html);
    fragment
        .select(&selector)
        .filter_map(|img| img.value().attr("src"))
        .map(str::trim)
        .filter(|src| !src.is_empty() && !src.starts_with("data:"))
        .map(str::to_owned)
        .collect()
}

/// Points image `src` attributes at local files. `local` maps a remote
/// reference (as returned by [`image_refs`], entities decoded) to the
/// relative path that replaces it.
pub fn rewrite_image_refs(html: &str, local: &BTreeMap<String, String>) -> String {
    if local.is_empty() {
        return html.to_owned();
    }

    let mut out = String::with_capacity(html.len());
    let mut rest = html;
    while let Some(pos) = rest.find("src=") {
        let (before, after) = rest.split_at(pos + "src=".len());
        out.push_str(before);
        rest = after;

        let Some(quote) = after.chars().next().filter(|c| *c == '"' || *c == '\'') else {
            continue;
        };
        let Some(len) = after[1..].find(quote) else {
            continue;
        };
        let raw_value = &after[1..1 + len];
        match local.get(decode_entities(raw_value).trim()) {
            Some(path) => {
                out.push(quote);
                out.push_str(path);
                out.push(quote);
            }
            None => out.push_str(&after[..len + 2]),
        }
        rest = &after[len + 2..];
    }
    out.push_str(rest);
    out
}

fn decode_entities(value: &str) -> Cow<'_, str> {
    if !value.contains('&') {
        return Cow::Borrowed(value);
    }

    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        let decoded = tail
            .find(';')
            .filter(|end| *end <= 10)
            .and_then(|end| decode_entity(&tail[1..end]).map(|c| (c, end)));
        match decoded {
            Some((c, end)) => {
                out.push(c);
                rest = &tail[end + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    Cow::Owned(out)
}

fn decode_entity(name: &str) -> Option<char> {
    match name {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        _ => {
            let number = name.strip_prefix('#')?;
            let code = match number.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => number.parse().ok()?,
            };
            char::from_u32(code)
        }
    }
}
