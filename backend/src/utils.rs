pub fn extract_youtube_video_id(input: &str) -> Option<String> {
    use url::Url;

    // Bare 11-character video ids are accepted as-is.
    if input.len() == 11
        && input
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Some(input.to_string());
    }

    let parsed_url = Url::parse(input).ok()?;
    let host = parsed_url.host_str()?;

    // Handle different YouTube URL formats
    match host {
        "www.youtube.com" | "youtube.com" | "m.youtube.com" => {
            // Standard YouTube URLs: https://www.youtube.com/watch?v=VIDEO_ID
            if parsed_url.path() == "/watch" {
                parsed_url
                    .query_pairs()
                    .find(|(key, _)| key == "v")
                    .map(|(_, value)| value.to_string())
            } else if let Some(id) = parsed_url.path().strip_prefix("/embed/") {
                // Embed URLs: https://www.youtube.com/embed/VIDEO_ID
                Some(id.to_string())
            } else {
                None
            }
        }
        "youtu.be" => {
            // Short YouTube URLs: https://youtu.be/VIDEO_ID
            parsed_url
                .path_segments()
                .and_then(|mut segments| segments.next_back())
                .map(|id| id.to_string())
        }
        _ => None,
    }
}
