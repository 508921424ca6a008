//! User-tunable capture behaviour ("choices").

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

/// What happens to captured streams when playback ends or the page unloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Preferences {
    /// Close disk sinks so the files are complete.
    pub finalize_fs_stream_when_video_finishes: bool,
    /// Forget every stream afterwards.
    pub delete_entries_when_video_finishes: bool,
    /// Save in-memory streams through the download target.
    pub download_content_when_video_finishes: bool,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            finalize_fs_stream_when_video_finishes: true,
            delete_entries_when_video_finishes: false,
            download_content_when_video_finishes: true,
        }
    }
}

impl Preferences {
    /// Merge a partial map. Values are coerced with JavaScript truthiness;
    /// unknown keys are skipped. Returns the skipped keys.
    pub fn apply_update(&mut self, update: &Map<String, Value>) -> Vec<String> {
        let mut unknown = Vec::new();
        for (key, value) in update {
            let flag = is_truthy(value);
            match key.as_str() {
                "finalize_fs_stream_when_video_finishes" => {
                    self.finalize_fs_stream_when_video_finishes = flag
                }
                "delete_entries_when_video_finishes" => {
                    self.delete_entries_when_video_finishes = flag
                }
                "download_content_when_video_finishes" => {
                    self.download_content_when_video_finishes = flag
                }
                other => {
                    warn!(key = %other, "Ignoring unknown preference");
                    unknown.push(other.to_owned());
                }
            }
        }
        unknown
    }
}

/// JavaScript `!!value`.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_truthiness() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(is_truthy(&json!(1)));
        assert!(is_truthy(&json!("no")));
        assert!(is_truthy(&json!([])));
        assert!(is_truthy(&json!({})));
    }

    #[test]
    fn test_apply_update() {
        let mut prefs = Preferences::default();
        let update = json!({
            "delete_entries_when_video_finishes": 1,
            "download_content_when_video_finishes": "",
            "bogus": true,
        });
        let unknown = prefs.apply_update(update.as_object().unwrap());

        assert_eq!(unknown, vec!["bogus".to_owned()]);
        assert!(prefs.delete_entries_when_video_finishes);
        assert!(!prefs.download_content_when_video_finishes);
        assert!(prefs.finalize_fs_stream_when_video_finishes);
    }

    #[test]
    fn test_serde_shape() {
        let value = serde_json::to_value(Preferences::default()).unwrap();
        assert_eq!(
            value,
            json!({
                "finalize_fs_stream_when_video_finishes": true,
                "delete_entries_when_video_finishes": false,
                "download_content_when_video_finishes": true,
            })
        );
        let partial: Preferences =
            serde_json::from_value(json!({"delete_entries_when_video_finishes": true})).unwrap();
        assert!(partial.delete_entries_when_video_finishes);
        assert!(partial.download_content_when_video_finishes);
    }
}
