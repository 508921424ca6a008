//! Host-side capabilities the engine plugs into.
//!
//! The host media pipeline is reached only through these traits. The engine
//! never owns a global: interception is installed by swapping the content of
//! a [`MediaSourceSlot`] the host resolves its media source through.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use url::Url;

use crate::error::HostError;

/// A consumer of appended media chunks for one track.
pub trait SourceBuffer: Send {
    fn append_buffer(&mut self, data: Bytes) -> Result<(), HostError>;
}

/// Factory of [`SourceBuffer`]s, one per track mime type.
pub trait MediaSource: Send + Sync {
    fn add_source_buffer(&self, mime_type: &str) -> Result<Box<dyn SourceBuffer>, HostError>;
}

/// Registration hook through which the host reaches its current media source.
pub struct MediaSourceSlot {
    current: RwLock<Arc<dyn MediaSource>>,
}

impl MediaSourceSlot {
    pub fn new(source: Arc<dyn MediaSource>) -> Self {
        Self {
            current: RwLock::new(source),
        }
    }

    /// The media source the host should use right now.
    pub fn current(&self) -> Arc<dyn MediaSource> {
        Arc::clone(&self.current.read())
    }

    /// Replace the current media source with `wrap(current)`.
    pub fn wrap<F>(&self, wrap: F)
    where
        F: FnOnce(Arc<dyn MediaSource>) -> Arc<dyn MediaSource>,
    {
        let mut current = self.current.write();
        let inner = Arc::clone(&current);
        *current = wrap(inner);
    }

    /// Convenience passthrough to the current source.
    pub fn add_source_buffer(&self, mime_type: &str) -> Result<Box<dyn SourceBuffer>, HostError> {
        self.current().add_source_buffer(mime_type)
    }
}

/// Loading state of the surrounding document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadyState {
    #[default]
    Loading,
    Interactive,
    Complete,
}

/// Read-only view of the page a stream is captured from.
pub trait PageContext: Send + Sync {
    /// Host name of the page URL, e.g. `www.youtube.com`.
    fn host(&self) -> String;

    /// Text content of the first element matching `selector`.
    fn query_text(&self, selector: &str) -> Option<String>;

    /// Value of a query parameter of the page URL.
    fn query_param(&self, name: &str) -> Option<String>;

    fn document_title(&self) -> String;

    fn ready_state(&self) -> ReadyState;
}

/// In-memory [`PageContext`] whose fields can be updated while streams are
/// being captured, simulating a page that is still loading.
pub struct StaticPage {
    url: Option<Url>,
    title: RwLock<String>,
    ready_state: RwLock<ReadyState>,
    elements: RwLock<HashMap<String, String>>,
}

impl StaticPage {
    pub fn new(url: Option<Url>, title: impl Into<String>) -> Self {
        Self {
            url,
            title: RwLock::new(title.into()),
            ready_state: RwLock::new(ReadyState::Loading),
            elements: RwLock::new(HashMap::new()),
        }
    }

    /// A fully loaded page with only a document title.
    pub fn loaded(url: Option<Url>, title: impl Into<String>) -> Self {
        let page = Self::new(url, title);
        page.set_ready_state(ReadyState::Complete);
        page
    }

    pub fn set_title(&self, title: impl Into<String>) {
        *self.title.write() = title.into();
    }

    pub fn set_ready_state(&self, state: ReadyState) {
        *self.ready_state.write() = state;
    }

    pub fn set_element(&self, selector: impl Into<String>, text: impl Into<String>) {
        self.elements.write().insert(selector.into(), text.into());
    }
}

impl PageContext for StaticPage {
    fn host(&self) -> String {
        self.url
            .as_ref()
            .and_then(|url| url.host_str())
            .unwrap_or_default()
            .to_owned()
    }

    fn query_text(&self, selector: &str) -> Option<String> {
        self.elements.read().get(selector).cloned()
    }

    fn query_param(&self, name: &str) -> Option<String> {
        self.url.as_ref().and_then(|url| {
            url.query_pairs()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.into_owned())
        })
    }

    fn document_title(&self) -> String {
        self.title.read().clone()
    }

    fn ready_state(&self) -> ReadyState {
        *self.ready_state.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nothing;

    impl SourceBuffer for Nothing {
        fn append_buffer(&mut self, _data: Bytes) -> Result<(), HostError> {
            Ok(())
        }
    }

    struct Refusing;

    impl MediaSource for Refusing {
        fn add_source_buffer(&self, mime_type: &str) -> Result<Box<dyn SourceBuffer>, HostError> {
            Err(HostError::new(format!("unsupported {mime_type}")))
        }
    }

    struct Accepting;

    impl MediaSource for Accepting {
        fn add_source_buffer(&self, _mime_type: &str) -> Result<Box<dyn SourceBuffer>, HostError> {
            Ok(Box::new(Nothing))
        }
    }

    #[test]
    fn test_slot_wrap_replaces_current() {
        let slot = MediaSourceSlot::new(Arc::new(Refusing));
        assert!(slot.add_source_buffer("video/mp4").is_err());

        slot.wrap(|_inner| Arc::new(Accepting));
        assert!(slot.add_source_buffer("video/mp4").is_ok());
    }

    #[test]
    fn test_static_page_url_parts() {
        let url = Url::parse("https://www.youtube.com/watch?v=abc123&t=4").unwrap();
        let page = StaticPage::new(Some(url), "Some title");
        assert_eq!(page.host(), "www.youtube.com");
        assert_eq!(page.query_param("v").as_deref(), Some("abc123"));
        assert_eq!(page.query_param("missing"), None);
        assert_eq!(page.ready_state(), ReadyState::Loading);

        page.set_ready_state(ReadyState::Complete);
        page.set_element("h1", "Heading");
        assert_eq!(page.ready_state(), ReadyState::Complete);
        assert_eq!(page.query_text("h1").as_deref(), Some("Heading"));
    }

    #[test]
    fn test_static_page_without_url() {
        let page = StaticPage::loaded(None, "Local");
        assert_eq!(page.host(), "");
        assert_eq!(page.query_param("v"), None);
        assert_eq!(page.document_title(), "Local");
    }
}
