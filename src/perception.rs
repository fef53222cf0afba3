use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config_manager::AgentConfig;
use crate::schema::MappedElement;

/// Raw element as the visual parser reports it, bbox still normalized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawElement {
    #[serde(default)]
    pub content: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    pub bbox_normalized: [f32; 4],
    #[serde(default)]
    pub interactivity: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScreenParse {
    #[serde(default)]
    pub elements: Vec<RawElement>,
}

/// Remote visual-parsing capability: image in, UI element list out.
#[async_trait]
pub trait PerceptionService: Send + Sync {
    async fn parse_screenshot(&self, image_b64: &str) -> Result<ScreenParse>;
}

pub struct HttpPerception {
    client: Client,
    base_url: String,
}

impl HttpPerception {
    pub fn new(config: &AgentConfig) -> Result<Self> {
        let client = Client::builder()
            .no_proxy()
            .timeout(config.request_timeout())
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: config.perception_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl PerceptionService for HttpPerception {
    async fn parse_screenshot(&self, image_b64: &str) -> Result<ScreenParse> {
        let url = format!("{}/parse", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&json!({ "base64_image": image_b64 }))
            .send()
            .await
            .context("Perception service unreachable")?;

        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "Perception service returned {}",
                response.status()
            ));
        }

        let parsed: ScreenParse = response
            .json()
            .await
            .context("Perception service returned a malformed payload")?;
        Ok(parsed)
    }
}

/// Convert normalized bboxes to pixel geometry against the screen size as it
/// is NOW, not as it was at capture. Element centers are integer midpoints
/// of the scaled corners.
pub fn map_elements(raw: &[RawElement], width: u32, height: u32) -> Vec<MappedElement> {
    raw.iter()
        .map(|el| {
            let [x1, y1, x2, y2] = el.bbox_normalized;
            let abs_x1 = (x1 * width as f32) as i32;
            let abs_y1 = (y1 * height as f32) as i32;
            let abs_x2 = (x2 * width as f32) as i32;
            let abs_y2 = (y2 * height as f32) as i32;
            MappedElement {
                content: el.content.trim().to_string(),
                kind: el.kind.clone(),
                center: ((abs_x1 + abs_x2) / 2, (abs_y1 + abs_y2) / 2),
                top_left: (abs_x1, abs_y1),
                bottom_right: (abs_x2, abs_y2),
                interactive: el.interactivity,
            }
        })
        .collect()
}

/// Compact text listing of the mapped elements, used both as LLM input for
/// the narrative pass and as the narrative itself when that pass fails.
pub fn describe_elements(elements: &[MappedElement]) -> String {
    let mut lines = Vec::new();
    for el in elements {
        lines.push(format!(
            "- \"{}\" ({}{}) center=({}, {})",
            el.content,
            el.kind,
            if el.interactive { ", interactive" } else { "" },
            el.center.0,
            el.center.1
        ));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(bbox: [f32; 4]) -> RawElement {
        RawElement {
            content: "Search".to_string(),
            kind: "text".to_string(),
            bbox_normalized: bbox,
            interactivity: true,
        }
    }

    #[test]
    fn test_bbox_center_conversion() {
        let mapped = map_elements(&[element([0.1, 0.2, 0.3, 0.4])], 1920, 1080);
        assert_eq!(mapped[0].center, (384, 324));
        assert_eq!(mapped[0].top_left, (192, 216));
        assert_eq!(mapped[0].bottom_right, (576, 432));
    }

    #[test]
    fn test_conversion_uses_given_screen_size() {
        // Same bbox, different current geometry, different pixels.
        let mapped = map_elements(&[element([0.5, 0.5, 0.5, 0.5])], 1280, 720);
        assert_eq!(mapped[0].center, (640, 360));
        let mapped = map_elements(&[element([0.5, 0.5, 0.5, 0.5])], 3840, 2160);
        assert_eq!(mapped[0].center, (1920, 1080));
    }

    #[test]
    fn test_describe_elements_mentions_coordinates() {
        let mapped = map_elements(&[element([0.0, 0.0, 1.0, 1.0])], 100, 100);
        let text = describe_elements(&mapped);
        assert!(text.contains("Search"));
        assert!(text.contains("(50, 50)"));
        assert!(text.contains("interactive"));
    }

    #[test]
    fn test_screen_parse_tolerates_missing_fields() {
        let parsed: ScreenParse = serde_json::from_str(
            r#"{"elements": [{"bbox_normalized": [0.1, 0.1, 0.2, 0.2]}]}"#,
        )
        .unwrap();
        assert_eq!(parsed.elements.len(), 1);
        assert!(!parsed.elements[0].interactivity);
    }
}
