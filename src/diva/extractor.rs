use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

/// URL shape of a soundgasm audio page.
const HOST_PAGE_PATTERN: &str = r"https?://soundgasm\.net/u/[\w-]+/[\w-]+";

/// URL shape of a direct soundgasm media file.
pub(crate) const MEDIA_FILE_PATTERN: &str =
    r"https?://media\.soundgasm\.net/sounds/[A-Za-z0-9]+\.m4a";

/// URL shape of a reddit submission.
const REDDIT_POST_PATTERN: &str = r"https?://(?:www\.)?reddit\.com/r/\w+/comments/[\w-]+(?:/[\w-]*)?";

static HOST_PAGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!("(?i){HOST_PAGE_PATTERN}")).unwrap());

static HOST_PAGE_EXACT: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!("(?i)^{HOST_PAGE_PATTERN}$")).unwrap());

static HOST_USER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)https?://soundgasm\.net/u/([\w-]+)/").unwrap());

static MEDIA_FILE_EXACT: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!("(?i)^{MEDIA_FILE_PATTERN}$")).unwrap());

static REDDIT_POST_EXACT: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!("(?i)^{REDDIT_POST_PATTERN}$")).unwrap());

static REDDIT_ARTICLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)reddit\.com/r/\w+/comments/([\w]+)").unwrap());

static PROFILE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:/?u/)?([\w-]{3,20})$").unwrap());

/// Pulls every soundgasm page link out of arbitrary text.
///
/// Matching substrings are returned verbatim, first occurrence wins, later
/// duplicates are dropped. Text with no links yields an empty vec.
pub(crate) fn extract_links(text: &str) -> Vec<String> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut links = Vec::new();
    for found in HOST_PAGE.find_iter(text) {
        let url = found.as_str();
        if seen.insert(url) {
            links.push(url.to_string());
        }
    }
    links
}

/// The performer handle inside a soundgasm page or media URL.
pub(crate) fn host_user(url: &str) -> Option<String> {
    HOST_USER
        .captures(url)
        .and_then(|caps| caps.get(1))
        .map(|user| user.as_str().to_string())
}

/// The base36 article id inside a reddit submission URL.
pub(crate) fn reddit_article(url: &str) -> Option<String> {
    REDDIT_ARTICLE
        .captures(url)
        .and_then(|caps| caps.get(1))
        .map(|id| id.as_str().to_lowercase())
}

/// One recognized entry from manual or file-based link input.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum ImportEntry {
    /// A bare reddit username whose feed should be scanned.
    Profile(String),
    /// A soundgasm page that needs resolution before download.
    HostPage(String),
    /// A direct media file, downloadable as-is.
    MediaLink(String),
    /// A reddit submission whose thread should be searched for links.
    RedditPost(String),
}

/// Classifies a single whitespace-separated import token, most specific
/// shape first. Tokens that match nothing are dropped by the caller.
pub(crate) fn parse_import_line(input: &str) -> Option<ImportEntry> {
    let token = input.trim();
    if token.is_empty() {
        return None;
    }

    if MEDIA_FILE_EXACT.is_match(token) {
        return Some(ImportEntry::MediaLink(token.to_string()));
    }
    if HOST_PAGE_EXACT.is_match(token) {
        return Some(ImportEntry::HostPage(token.to_string()));
    }
    if REDDIT_POST_EXACT.is_match(token) {
        return Some(ImportEntry::RedditPost(token.to_string()));
    }
    if let Some(caps) = PROFILE_NAME.captures(token) {
        return Some(ImportEntry::Profile(caps[1].to_string()));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_links_inside_markup() {
        let text = r#"<p>new audio <a href="https://soundgasm.net/u/velvet-voice/Midnight-Story">here</a>
            and a mirror at http://soundgasm.net/u/velvet-voice/Midnight-Story-mirror</p>"#;
        let links = extract_links(text);
        assert_eq!(
            links,
            vec![
                "https://soundgasm.net/u/velvet-voice/Midnight-Story".to_string(),
                "http://soundgasm.net/u/velvet-voice/Midnight-Story-mirror".to_string(),
            ]
        );
    }

    #[test]
    fn duplicate_links_collapse_to_one() {
        let url = "https://soundgasm.net/u/someone/repeat-me";
        let text = format!("{url} again {url} and once more {url}");
        assert_eq!(extract_links(&text), vec![url.to_string()]);
    }

    #[test]
    fn foreign_hosts_are_ignored() {
        let text = "https://example.com/u/no/thanks https://media.soundgasm.net/sounds/abc123.m4a";
        assert!(extract_links(text).is_empty());
    }

    #[test]
    fn garbage_input_yields_nothing() {
        assert!(extract_links("").is_empty());
        assert!(extract_links("https://soundgasm.net/u/orphaned").is_empty());
        assert!(extract_links("\u{0}\u{1}<<<>>>").is_empty());
    }

    #[test]
    fn host_match_is_case_insensitive_and_verbatim() {
        let text = "HTTPS://SOUNDGASM.NET/u/Loud/Voice";
        assert_eq!(extract_links(text), vec![text.to_string()]);
    }

    #[test]
    fn pulls_performer_from_page_url() {
        assert_eq!(
            host_user("https://soundgasm.net/u/velvet-voice/Midnight-Story"),
            Some("velvet-voice".to_string())
        );
        assert_eq!(host_user("https://example.com/u/velvet-voice/x"), None);
    }

    #[test]
    fn pulls_article_id_from_post_url() {
        assert_eq!(
            reddit_article("https://www.reddit.com/r/audiodrama/comments/1abc2d/a_title_slug/"),
            Some("1abc2d".to_string())
        );
    }

    #[test]
    fn classifies_each_import_shape() {
        assert_eq!(
            parse_import_line("  velvet-voice "),
            Some(ImportEntry::Profile("velvet-voice".to_string()))
        );
        assert_eq!(
            parse_import_line("u/velvet-voice"),
            Some(ImportEntry::Profile("velvet-voice".to_string()))
        );
        assert_eq!(
            parse_import_line("https://soundgasm.net/u/velvet-voice/Midnight-Story"),
            Some(ImportEntry::HostPage(
                "https://soundgasm.net/u/velvet-voice/Midnight-Story".to_string()
            ))
        );
        assert_eq!(
            parse_import_line("https://media.soundgasm.net/sounds/f00ba4.m4a"),
            Some(ImportEntry::MediaLink(
                "https://media.soundgasm.net/sounds/f00ba4.m4a".to_string()
            ))
        );
        assert_eq!(
            parse_import_line("https://reddit.com/r/audiodrama/comments/1abc2d/slug"),
            Some(ImportEntry::RedditPost(
                "https://reddit.com/r/audiodrama/comments/1abc2d/slug".to_string()
            ))
        );
        assert_eq!(parse_import_line("ftp://soundgasm.net/u/a/b"), None);
        assert_eq!(parse_import_line(""), None);
    }
}
