//! Source URL validation.

use url::Url;

const WATCH_HOSTS: [&str; 4] = [
    "youtube.com",
    "www.youtube.com",
    "m.youtube.com",
    "music.youtube.com",
];

/// Whether `raw` names a single YouTube video.
///
/// Accepts `http(s)://{www.,m.,music.}youtube.com/watch?v=<id>` and
/// `http(s)://youtu.be/<id>`.
pub fn is_youtube_url(raw: &str) -> bool {
    video_id(raw).is_some()
}

/// Extract the video id from a supported URL.
pub fn video_id(raw: &str) -> Option<String> {
    let url = Url::parse(raw.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    let host = url.host_str()?.to_ascii_lowercase();

    let id = if host == "youtu.be" {
        url.path_segments()?.next()?.to_string()
    } else if WATCH_HOSTS.contains(&host.as_str()) && url.path() == "/watch" {
        url.query_pairs()
            .find(|(key, _)| key == "v")
            .map(|(_, value)| value.into_owned())?
    } else {
        return None;
    };

    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    valid.then_some(id)
}
