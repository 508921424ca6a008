//! Human-friendly, filesystem-safe names for captured streams.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::config::CaptureConfig;
use crate::host::{PageContext, ReadyState};

const YOUTUBE_TITLE_SELECTOR: &str = "#title > h1 > yt-formatted-string, .watch-content .slim-video-information-title > .yt-core-attributed-string";
const TWITCH_TITLE_SELECTOR: &str = "[data-a-target='stream-title']";

/// Extension used when the mime type has no subtype.
const FALLBACK_EXTENSION: &str = "bin";

/// Replace characters that are illegal in filenames with look-alike glyphs.
///
/// `*` has no usable look-alike and is dropped. None of the substitutes is
/// itself in the illegal set, so sanitizing twice is the same as once.
pub fn sanitize_title(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '<' => result.push('‹'),
            '>' => result.push('›'),
            ':' => result.push('∶'),
            '"' => result.push('″'),
            '/' => result.push('∕'),
            '\\' => result.push('∖'),
            '|' => result.push('¦'),
            '?' => result.push('¿'),
            '*' => {}
            other => result.push(other),
        }
    }
    result
}

/// Subtype of a mime type without parameters: `video/mp4; codecs="avc1"` -> `mp4`.
pub fn mime_subtype(mime_type: &str) -> &str {
    let Some((_, rest)) = mime_type.split_once('/') else {
        return FALLBACK_EXTENSION;
    };
    let subtype = rest.split(';').next().unwrap_or_default().trim();
    if subtype.is_empty() {
        FALLBACK_EXTENSION
    } else {
        subtype
    }
}

/// `"<title> [<id>].<subtype>"`, sanitized.
pub fn compose_title(title: &str, id: &str, mime_type: &str) -> String {
    sanitize_title(&format!(
        "{} [{}].{}",
        title.trim(),
        id,
        mime_subtype(mime_type)
    ))
}

/// One title sample taken from the page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitleSample {
    pub title: String,
    /// Whether the page heuristic is confident the title will not change.
    pub stable: bool,
}

/// Ask the page for the best title it can offer right now.
pub fn suggest_title(page: &dyn PageContext) -> TitleSample {
    let host = page.host();
    let non_empty = |text: Option<String>| {
        text.map(|t| t.trim().to_owned())
            .filter(|t| !t.is_empty())
    };

    if host.ends_with("youtube.com") {
        let title = non_empty(page.query_text(YOUTUBE_TITLE_SELECTOR));
        let video_id = non_empty(page.query_param("v"));
        if let (Some(title), Some(video_id)) = (title, video_id) {
            return TitleSample {
                title: format!("{title} [{video_id}]"),
                stable: true,
            };
        }
    } else if host.ends_with("twitch.tv") {
        if let Some(title) = non_empty(page.query_text(TWITCH_TITLE_SELECTOR)) {
            return TitleSample {
                title,
                stable: true,
            };
        }
    } else {
        return TitleSample {
            title: page.document_title(),
            stable: true,
        };
    }

    // Known site whose metadata has not rendered yet.
    TitleSample {
        title: page.document_title(),
        stable: false,
    }
}

/// Samples the page until a stable title is found or the retry budget runs out.
#[derive(Clone)]
pub struct TitleResolver {
    page: Arc<dyn PageContext>,
    retry_delay: Duration,
    max_retries: u32,
}

impl TitleResolver {
    pub fn new(page: Arc<dyn PageContext>, config: &CaptureConfig) -> Self {
        Self {
            page,
            retry_delay: config.title_retry_delay,
            max_retries: config.title_max_retries,
        }
    }

    /// Current composed title for a stream, plus whether it may be treated as final.
    pub fn sample(&self, id: &str, mime_type: &str) -> TitleSample {
        let suggestion = suggest_title(self.page.as_ref());
        TitleSample {
            title: compose_title(&suggestion.title, id, mime_type),
            stable: suggestion.stable && self.page.ready_state() == ReadyState::Complete,
        }
    }

    /// Drive title resolution for one stream.
    ///
    /// `apply(title, is_final)` publishes every sample; it returns `false`
    /// once the stream is gone, which ends resolution early. The first sample
    /// is published immediately and is never final.
    pub async fn resolve<F>(&self, id: &str, mime_type: &str, mut apply: F)
    where
        F: FnMut(String, bool) -> bool,
    {
        let first = self.sample(id, mime_type);
        if !apply(first.title, false) {
            return;
        }

        let mut attempt = 0;
        loop {
            tokio::time::sleep(self.retry_delay).await;

            let sample = self.sample(id, mime_type);
            let is_final = sample.stable || attempt >= self.max_retries;
            trace!(stream_id = %id, attempt, stable = sample.stable, "Sampled title");

            if !apply(sample.title.clone(), is_final) {
                debug!(stream_id = %id, "Stream gone, title resolution stopped");
                return;
            }
            if is_final {
                debug!(stream_id = %id, title = %sample.title, "Title resolved");
                return;
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::StaticPage;
    use url::Url;

    #[test]
    fn test_sanitize_title_mapping() {
        assert_eq!(
            sanitize_title(r#"a<b>c:d"e/f\g|h?i*j"#),
            "a‹b›c∶d″e∕f∖g¦h¿ij"
        );
        assert_eq!(sanitize_title("plain name"), "plain name");
    }

    #[test]
    fn test_sanitize_title_is_idempotent() {
        let inputs = [
            r#"What? <Live> "Now" 12:30 a/b\c|d*"#,
            "",
            "***",
            "‹already› ∶ safe",
        ];
        for input in inputs {
            let once = sanitize_title(input);
            assert_eq!(sanitize_title(&once), once, "input: {input}");
        }
    }

    #[test]
    fn test_mime_subtype() {
        assert_eq!(mime_subtype("video/mp4"), "mp4");
        assert_eq!(mime_subtype(r#"video/mp4; codecs="avc1.64001f""#), "mp4");
        assert_eq!(mime_subtype("audio/webm;codecs=opus"), "webm");
        assert_eq!(mime_subtype("garbage"), "bin");
        assert_eq!(mime_subtype("video/"), "bin");
    }

    #[test]
    fn test_compose_title() {
        assert_eq!(compose_title("Clip", "id", "video/mp4"), "Clip [id].mp4");
        assert_eq!(
            compose_title("Q&A: part 1/2", "x", "audio/mp4"),
            "Q&A∶ part 1∕2 [x].mp4"
        );
    }

    #[test]
    fn test_suggest_title_generic_site_is_stable() {
        let page = StaticPage::new(Url::parse("https://example.com/v").ok(), "Doc");
        let sample = suggest_title(&page);
        assert_eq!(sample.title, "Doc");
        assert!(sample.stable);
    }

    #[test]
    fn test_suggest_title_youtube() {
        let url = Url::parse("https://www.youtube.com/watch?v=dQw4w9WgXcQ").ok();
        let page = StaticPage::new(url, "YouTube");

        let sample = suggest_title(&page);
        assert_eq!(sample.title, "YouTube");
        assert!(!sample.stable);

        page.set_element(YOUTUBE_TITLE_SELECTOR, "  Song  ");
        let sample = suggest_title(&page);
        assert_eq!(sample.title, "Song [dQw4w9WgXcQ]");
        assert!(sample.stable);
    }

    #[test]
    fn test_suggest_title_twitch() {
        let page = StaticPage::new(Url::parse("https://www.twitch.tv/someone").ok(), "Twitch");
        assert!(!suggest_title(&page).stable);

        page.set_element(TWITCH_TITLE_SELECTOR, "Speedrun");
        let sample = suggest_title(&page);
        assert_eq!(sample.title, "Speedrun");
        assert!(sample.stable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_waits_for_complete_page() {
        let page = Arc::new(StaticPage::new(
            Url::parse("https://example.com/").ok(),
            "Loading",
        ));
        let config = CaptureConfig::default();
        let resolver = TitleResolver::new(page.clone(), &config);

        let mut seen = Vec::new();
        let page_for_apply = page.clone();
        resolver
            .resolve("id1", "video/mp4", |title, is_final| {
                seen.push((title, is_final));
                if seen.len() == 2 {
                    page_for_apply.set_title("Loaded");
                    page_for_apply.set_ready_state(ReadyState::Complete);
                }
                true
            })
            .await;

        assert_eq!(
            seen,
            vec![
                ("Loading [id1].mp4".to_owned(), false),
                ("Loading [id1].mp4".to_owned(), false),
                ("Loaded [id1].mp4".to_owned(), true),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_degrades_after_budget() {
        let page = Arc::new(StaticPage::new(
            Url::parse("https://www.youtube.com/watch?v=abc").ok(),
            "Raw page",
        ));
        page.set_ready_state(ReadyState::Complete);
        let config = CaptureConfig::builder().title_max_retries(2).build();
        let resolver = TitleResolver::new(page, &config);

        let mut seen = Vec::new();
        resolver
            .resolve("id", "video/webm", |title, is_final| {
                seen.push((title, is_final));
                true
            })
            .await;

        // immediate + attempts 0, 1, 2
        assert_eq!(seen.len(), 4);
        assert!(seen[..3].iter().all(|(_, f)| !f));
        assert_eq!(seen[3], ("Raw page [id].webm".to_owned(), true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_stops_when_stream_gone() {
        let page = Arc::new(StaticPage::new(None, "t"));
        let resolver = TitleResolver::new(page, &CaptureConfig::default());

        let mut calls = 0;
        resolver
            .resolve("id", "video/mp4", |_, _| {
                calls += 1;
                calls < 2
            })
            .await;
        assert_eq!(calls, 2);
    }
}
