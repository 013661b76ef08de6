use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use chrono::{DateTime, SecondsFormat, Utc};

use crate::archive_store::{MEDIA_DIR, StoryArchiveDir, media_file_name};
use crate::formats::{ChatReply, Chapter, StoryMetadata};

pub const VIEW_DIR: &str = "view";
pub const DEFAULT_PAGE_BYTES: usize = 200_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderOptions {
    /// A page is closed once adding the next chapter would push it past this size.
    pub page_bytes: usize,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            page_bytes: DEFAULT_PAGE_BYTES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderSummary {
    pub out_dir: PathBuf,
    pub pages: usize,
    pub chapters: usize,
    pub replies: usize,
}

/// One chapter and the chat that followed it. The leading section has no
/// chapter and holds replies posted before the first chapter.
#[derive(Debug)]
struct Section<'a> {
    chapter: Option<&'a Chapter>,
    replies: Vec<&'a ChatReply>,
}

impl Section<'_> {
    fn weight(&self) -> usize {
        self.chapter.map_or(0, |c| c.body.len())
            + self.replies.iter().map(|r| r.body.len()).sum::<usize>()
    }
}

/// Renders one archive into static HTML pages.
///
/// With `output_root == None` the view lands in `<archive>/view/`; otherwise
/// in `<output_root>/<archive folder name>/` with the media it uses copied
/// alongside. Only archive files are read, and identical input produces
/// identical output.
pub fn render(
    archive: &Path,
    output_root: Option<&Path>,
    options: &RenderOptions,
) -> anyhow::Result<RenderSummary> {
    if !crate::inspect::is_archive(archive) {
        anyhow::bail!("not a story archive: {}", archive.display());
    }
    let store = StoryArchiveDir::open(archive);
    let metadata = store.read_metadata().context("read metadata")?;
    let mut chapters = store.read_chapters().context("read chapters")?;
    let mut chat = store.read_chat().context("read chat")?;

    chapters.sort_by_key(|chapter| chapter.position);
    if let Some(pair) = chapters.windows(2).find(|w| w[0].position == w[1].position) {
        anyhow::bail!("duplicate chapter position {} in archive", pair[0].position);
    }
    chat.sort_by(|a, b| (a.posted_at, &a.id).cmp(&(b.posted_at, &b.id)));

    let folder_name = archive
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("archive path has no folder name: {}", archive.display()))?;
    let (out_dir, media_prefix, copy_media) = match output_root {
        None => (archive.join(VIEW_DIR), format!("../{MEDIA_DIR}/"), false),
        Some(root) => (root.join(folder_name), format!("{MEDIA_DIR}/"), true),
    };
    fs::create_dir_all(&out_dir)
        .with_context(|| format!("create view dir: {}", out_dir.display()))?;

    let media = collect_local_media(&store, &chapters, &chat, &media_prefix);
    if copy_media && !media.is_empty() {
        let media_out = out_dir.join(MEDIA_DIR);
        fs::create_dir_all(&media_out)
            .with_context(|| format!("create view media dir: {}", media_out.display()))?;
        for image_ref in media.keys() {
            let file_name = media_file_name(image_ref);
            fs::copy(store.media_path(image_ref), media_out.join(&file_name))
                .with_context(|| format!("copy media: {file_name}"))?;
        }
    }

    let sections = build_sections(&chapters, &chat);
    let pages = paginate(&sections, options.page_bytes);

    remove_stale_pages(&out_dir)?;
    for (idx, page) in pages.iter().enumerate() {
        let html = render_page(&metadata, page, idx, pages.len(), &media);
        let path = out_dir.join(page_file_name(idx));
        fs::write(&path, html).with_context(|| format!("write page: {}", path.display()))?;
    }
    let index_path = out_dir.join("index.html");
    fs::write(&index_path, render_index(&metadata, &pages))
        .with_context(|| format!("write index: {}", index_path.display()))?;
    let css_path = out_dir.join("style.css");
    fs::write(&css_path, default_style_css())
        .with_context(|| format!("write stylesheet: {}", css_path.display()))?;

    Ok(RenderSummary {
        out_dir,
        pages: pages.len(),
        chapters: chapters.len(),
        replies: chat.len(),
    })
}

fn collect_local_media(
    store: &StoryArchiveDir,
    chapters: &[Chapter],
    chat: &[ChatReply],
    prefix: &str,
) -> BTreeMap<String, String> {
    let bodies = chapters
        .iter()
        .map(|c| c.body.as_str())
        .chain(chat.iter().map(|r| r.body.as_str()));

    let mut media = BTreeMap::new();
    for body in bodies {
        for image_ref in crate::media::image_refs(body) {
            if media.contains_key(&image_ref) || !store.has_media(&image_ref) {
                continue;
            }
            let local = format!("{prefix}{}", media_file_name(&image_ref));
            media.insert(image_ref, local);
        }
    }
    media
}

fn build_sections<'a>(chapters: &'a [Chapter], chat: &'a [ChatReply]) -> Vec<Section<'a>> {
    let mut sections = Vec::with_capacity(chapters.len() + 1);
    sections.push(Section {
        chapter: None,
        replies: Vec::new(),
    });
    let mut by_position = BTreeMap::new();
    for chapter in chapters {
        by_position.insert(chapter.position, sections.len());
        sections.push(Section {
            chapter: Some(chapter),
            replies: Vec::new(),
        });
    }

    for reply in chat {
        let idx = reply
            .after_chapter
            .and_then(|position| by_position.get(&position).copied())
            .unwrap_or_else(|| chapters.partition_point(|c| c.posted_at <= reply.posted_at));
        sections[idx].replies.push(reply);
    }

    if sections[0].replies.is_empty() {
        sections.remove(0);
    }
    sections
}

fn paginate<'s, 'a>(sections: &'s [Section<'a>], page_bytes: usize) -> Vec<Vec<&'s Section<'a>>> {
    let mut pages: Vec<Vec<&Section>> = Vec::new();
    let mut current: Vec<&Section> = Vec::new();
    let mut current_bytes = 0usize;

    for section in sections {
        let weight = section.weight();
        if !current.is_empty() && current_bytes + weight > page_bytes {
            pages.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current.push(section);
        current_bytes += weight;
    }
    if !current.is_empty() || pages.is_empty() {
        pages.push(current);
    }
    pages
}

fn page_file_name(idx: usize) -> String {
    format!("page-{:04}.html", idx + 1)
}

fn remove_stale_pages(out_dir: &Path) -> anyhow::Result<()> {
    for entry in fs::read_dir(out_dir).with_context(|| format!("read dir: {}", out_dir.display()))? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("page-") && name.ends_with(".html") {
            fs::remove_file(entry.path())
                .with_context(|| format!("remove stale page: {}", entry.path().display()))?;
        }
    }
    Ok(())
}

fn render_index(metadata: &StoryMetadata, pages: &[Vec<&Section>]) -> String {
    let mut body = String::new();
    body.push_str(&format!("<h1>{}</h1>\n", html_escape(&metadata.title)));
    if let Some(author) = metadata.author.as_deref() {
        body.push_str(&format!("<p class=\"author\">by {}</p>\n", html_escape(author)));
    }
    if let Some(description) = metadata.description.as_deref() {
        body.push_str(&format!(
            "<div class=\"description\">{}</div>\n",
            html_escape(description)
        ));
    }

    body.push_str("<dl class=\"stats\">\n");
    if let Some(created) = metadata.created_at {
        body.push_str(&format!("  <dt>Created</dt><dd>{}</dd>\n", timestamp(created)));
    }
    if let Some(updated) = metadata.updated_at {
        body.push_str(&format!("  <dt>Updated</dt><dd>{}</dd>\n", timestamp(updated)));
    }
    body.push_str(&format!(
        "  <dt>Chapters</dt><dd>{}</dd>\n  <dt>Replies</dt><dd>{}</dd>\n  <dt>Likes</dt><dd>{}</dd>\n",
        metadata.chapter_count, metadata.reply_count, metadata.like_count
    ));
    body.push_str("</dl>\n");

    body.push_str("<ol class=\"pages\">\n");
    for (idx, page) in pages.iter().enumerate() {
        let label = page_label(page).unwrap_or_else(|| format!("Page {}", idx + 1));
        body.push_str(&format!(
            "  <li><a href=\"{}\">{}</a></li>\n",
            page_file_name(idx),
            html_escape(&label)
        ));
    }
    body.push_str("</ol>\n");

    wrap_html_document(&metadata.title, &body)
}

fn page_label(page: &[&Section]) -> Option<String> {
    let mut chapters = page.iter().filter_map(|s| s.chapter);
    let first = chapters.next()?;
    let last = chapters.last().unwrap_or(first);
    if first.position == last.position {
        Some(chapter_title(first))
    } else {
        Some(format!("{} to {}", chapter_title(first), chapter_title(last)))
    }
}

fn render_page(
    metadata: &StoryMetadata,
    page: &[&Section],
    idx: usize,
    page_count: usize,
    media: &BTreeMap<String, String>,
) -> String {
    let nav = render_nav(idx, page_count);
    let mut body = String::new();
    body.push_str(&nav);
    body.push_str(&format!(
        "<h1><a href=\"index.html\">{}</a></h1>\n",
        html_escape(&metadata.title)
    ));

    for section in page {
        if let Some(chapter) = section.chapter {
            body.push_str(&format!(
                "<article class=\"chapter\" id=\"chapter-{}\">\n<h2>{}</h2>\n<p class=\"posted\">{}</p>\n<div class=\"body\">\n{}\n</div>\n</article>\n",
                chapter.position,
                html_escape(&chapter_title(chapter)),
                timestamp(chapter.posted_at),
                crate::media::rewrite_image_refs(chapter.body.trim(), media)
            ));
        }
        if section.replies.is_empty() {
            continue;
        }
        body.push_str("<section class=\"chat\">\n");
        for reply in &section.replies {
            body.push_str(&format!(
                "<div class=\"reply\" id=\"reply-{}\">\n<p class=\"meta\"><span class=\"author\">{}</span> <time>{}</time></p>\n<div class=\"body\">{}</div>\n</div>\n",
                html_escape(&reply.id),
                html_escape(reply.author.as_deref().unwrap_or("Anonymous")),
                timestamp(reply.posted_at),
                crate::media::rewrite_image_refs(reply.body.trim(), media)
            ));
        }
        body.push_str("</section>\n");
    }
    body.push_str(&nav);

    let title = format!("{} ({}/{})", metadata.title, idx + 1, page_count);
    wrap_html_document(&title, &body)
}

fn render_nav(idx: usize, page_count: usize) -> String {
    let mut nav = String::from("<nav>");
    if idx > 0 {
        nav.push_str(&format!("<a rel=\"prev\" href=\"{}\">Previous</a> ", page_file_name(idx - 1)));
    }
    nav.push_str("<a href=\"index.html\">Index</a>");
    if idx + 1 < page_count {
        nav.push_str(&format!(" <a rel=\"next\" href=\"{}\">Next</a>", page_file_name(idx + 1)));
    }
    nav.push_str("</nav>\n");
    nav
}

fn chapter_title(chapter: &Chapter) -> String {
    match chapter.title.as_deref().map(str::trim) {
        Some(title) if !title.is_empty() => title.to_owned(),
        _ => format!("Chapter {}", chapter.position),
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn wrap_html_document(title: &str, body_html: &str) -> String {
    let mut out = String::new();
    out.push_str("<!DOCTYPE html>\n");
    out.push_str("<html>\n");
    out.push_str("<head>\n");
    out.push_str("  <meta charset=\"utf-8\">\n");
    out.push_str(&format!("  <title>{}</title>\n", html_escape(title)));
    out.push_str("  <link rel=\"stylesheet\" href=\"style.css\">\n");
    out.push_str("</head>\n");
    out.push_str("<body>\n");
    out.push_str(body_html);
    if !body_html.ends_with('\n') {
        out.push('\n');
    }
    out.push_str("</body>\n");
    out.push_str("</html>\n");
    out
}

fn default_style_css() -> &'static str {
    r#"body { max-width: 48em; margin: 0 auto; padding: 0 1.2em; font-family: serif; line-height: 1.6; }
img { max-width: 100%; height: auto; }
nav { margin: 1em 0; font-family: sans-serif; }
.chapter { margin: 2em 0; }
.posted, .meta { color: #666; font-size: 0.85em; font-family: sans-serif; }
.chat { margin: 1em 0 2em; padding: 0.5em 1em; background: #f6f8fa; border-left: 4px solid #ddd; }
.reply { margin: 0.5em 0; }
.reply .author { font-weight: bold; }
"#
}

fn html_escape(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone as _;

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_600_000_000 + secs, 0).unwrap()
    }

    fn chapter(position: u64, secs: i64, body: &str) -> Chapter {
        Chapter {
            position,
            id: format!("c{position}"),
            title: None,
            body: body.to_owned(),
            posted_at: at(secs),
        }
    }

    fn reply(id: &str, secs: i64, after_chapter: Option<u64>) -> ChatReply {
        ChatReply {
            id: id.to_owned(),
            author: None,
            body: format!("<p>{id}</p>"),
            posted_at: at(secs),
            after_chapter,
        }
    }

    #[test]
    fn replies_follow_their_chapter_by_reference_or_time() {
        let chapters = vec![chapter(1, 10, "a"), chapter(2, 20, "b")];
        let chat = vec![
            reply("early", 5, None),
            reply("t15", 15, None),
            reply("pinned", 16, Some(2)),
            reply("t25", 25, None),
        ];

        let sections = build_sections(&chapters, &chat);
        let layout = sections
            .iter()
            .map(|s| {
                (
                    s.chapter.map(|c| c.position),
                    s.replies.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
                )
            })
            .collect::<Vec<_>>();
        assert_eq!(
            layout,
            vec![
                (None, vec!["early"]),
                (Some(1), vec!["t15"]),
                (Some(2), vec!["pinned", "t25"]),
            ]
        );
    }

    #[test]
    fn prelude_section_is_dropped_when_empty() {
        let chapters = vec![chapter(1, 10, "a")];
        let sections = build_sections(&chapters, &[]);
        assert_eq!(sections.len(), 1);
        assert!(sections[0].chapter.is_some());
    }

    #[test]
    fn pagination_splits_at_chapter_boundaries() {
        let body = "x".repeat(40);
        let chapters = (1..=5).map(|p| chapter(p, p as i64, &body)).collect::<Vec<_>>();
        let sections = build_sections(&chapters, &[]);

        let pages = paginate(&sections, 100);
        let sizes = pages.iter().map(Vec::len).collect::<Vec<_>>();
        assert_eq!(sizes, vec![2, 2, 1]);

        let single = paginate(&sections, usize::MAX);
        assert_eq!(single.len(), 1);
    }

    #[test]
    fn oversized_chapter_gets_its_own_page() {
        let chapters = vec![chapter(1, 1, &"x".repeat(500)), chapter(2, 2, "small")];
        let sections = build_sections(&chapters, &[]);
        let pages = paginate(&sections, 100);
        assert_eq!(pages.len(), 2);
    }

    #[test]
    fn empty_archive_still_has_one_page() {
        let pages = paginate(&[], 100);
        assert_eq!(pages.len(), 1);
        assert!(pages[0].is_empty());
    }
}
