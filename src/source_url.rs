/// YouTube URL validation and normalization.
///
/// Accepted shapes are `youtube.com/watch?v=<id>` and `youtu.be/<id>`, with an
/// optional scheme/`www.` prefix. The video id is always 11 characters of
/// `[A-Za-z0-9_-]`. Anything else is rejected before a task is created.
pub fn extract_video_id(url: &str) -> Option<String> {
    let trimmed = url.trim();
    let rest = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))?;
    let rest = rest.strip_prefix("www.").unwrap_or(rest);

    let candidate = if let Some(after) = rest.strip_prefix("youtube.com/watch?") {
        after
            .split('&')
            .find_map(|pair| pair.strip_prefix("v="))?
    } else if let Some(after) = rest.strip_prefix("youtu.be/") {
        after.split(['?', '&', '#']).next()?
    } else {
        return None;
    };

    if candidate.len() == 11
        && candidate
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        Some(candidate.to_string())
    } else {
        None
    }
}

/// Canonical form used for cache keying: the same video requested through
/// `youtu.be` and `youtube.com` must hash to the same entry.
pub fn normalize_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={video_id}")
}

/// Derive a download filename from the artifact title. Keeps word characters,
/// spaces and hyphens, collapses whitespace to underscores and caps the stem
/// at 50 characters.
pub fn safe_file_name(title: &str) -> String {
    let stem: String = title
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '-' || *c == '_')
        .collect();
    let stem = stem
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .chars()
        .take(50)
        .collect::<String>();
    let stem = stem.trim_matches('_').to_string();

    if stem.is_empty() {
        "youtube_audio.mp3".to_string()
    } else {
        format!("{stem}.mp3")
    }
}
