// Discovery input - the item list produced by the metadata fetcher
use crate::error::{PipelineError, Result};
use crate::pipeline::item::{DiscoveredItem, WorkItemId};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// One entry of the discovered-items file. Either `id` (a platform id such as
/// a reel shortcode) or `source` (the canonical URL) must be present.
#[derive(Debug, Deserialize)]
struct DiscoveryEntry {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

impl DiscoveryEntry {
    fn into_item(self, index: usize) -> Result<DiscoveredItem> {
        let id = match (self.id.as_deref().map(str::trim), self.source.as_deref()) {
            (Some(id), _) if !id.is_empty() => WorkItemId::new(id),
            (_, Some(source)) if !source.trim().is_empty() => WorkItemId::from_content(source),
            _ => {
                return Err(PipelineError::Discovery(format!(
                    "entry {} has neither an id nor a source",
                    index
                )))
            }
        };

        let mut metadata = self.metadata;
        if let Some(source) = self.source {
            metadata.entry("source".to_string()).or_insert(source);
        }
        Ok(DiscoveredItem { id, metadata })
    }
}

pub fn parse_items(json: &str) -> Result<Vec<DiscoveredItem>> {
    let entries: Vec<DiscoveryEntry> = serde_json::from_str(json)
        .map_err(|e| PipelineError::Discovery(format!("malformed item list: {}", e)))?;

    entries
        .into_iter()
        .enumerate()
        .map(|(index, entry)| entry.into_item(index))
        .collect()
}

pub async fn load_items(path: &Path) -> Result<Vec<DiscoveredItem>> {
    let json = tokio::fs::read_to_string(path).await.map_err(|e| {
        PipelineError::Discovery(format!("cannot read {}: {}", path.display(), e))
    })?;
    let items = parse_items(&json)?;
    tracing::info!(path = %path.display(), items = items.len(), "🔍 Loaded discovered items");
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_id_wins_over_source() {
        let items = parse_items(
            r#"[
                {"id": "Cx1AbC", "source": "https://www.instagram.com/reel/Cx1AbC/", "metadata": {"caption": "hi"}},
                {"source": "https://www.instagram.com/reel/Zz9XyZ/"}
            ]"#,
        )
        .unwrap();

        assert_eq!(items[0].id, WorkItemId::new("Cx1AbC"));
        assert_eq!(items[0].metadata["caption"], "hi");
        assert_eq!(
            items[0].metadata["source"],
            "https://www.instagram.com/reel/Cx1AbC/"
        );
        assert_eq!(
            items[1].id,
            WorkItemId::from_content("https://www.instagram.com/reel/Zz9XyZ/")
        );
    }

    #[test]
    fn test_rediscovery_yields_same_ids() {
        let json = r#"[{"source": "https://www.instagram.com/reel/Zz9XyZ/"}]"#;
        assert_eq!(parse_items(json).unwrap(), parse_items(json).unwrap());
    }

    #[test]
    fn test_entry_without_identity_is_rejected() {
        let err = parse_items(r#"[{"id": "a"}, {"metadata": {}}]"#).unwrap_err();
        assert!(err.to_string().contains("entry 1"));
        assert!(matches!(parse_items("{}"), Err(PipelineError::Discovery(_))));
    }
}
