use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::domain::date_stamp;
use crate::error::SyncError;
use crate::publish::write_bytes_atomic;

static LAYER_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"NAME "(\w+)_(\d{8})""#).expect("static layer name regex"));

/// Impact layer code and its display title.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerType {
    pub code: String,
    pub title: String,
}

pub fn ibew_layer_types() -> Vec<LayerType> {
    [
        ("healthtot", "Health Centers Affected"),
        ("popaff100", "People Affected 100cm"),
        ("popaff25", "People Affected 25cm"),
        ("popafftot", "Total People Affected"),
        ("popage100", "Vulnerable Age Groups 100cm"),
        ("popage25", "Vulnerable Age Groups 25cm"),
        ("popmob100", "Reduced Mobility 100cm"),
        ("popmob25", "Reduced Mobility 25cm"),
    ]
    .into_iter()
    .map(|(code, title)| LayerType {
        code: code.to_string(),
        title: title.to_string(),
    })
    .collect()
}

/// Dates (YYYYMMDD) that already have at least one layer block.
pub fn existing_dates(content: &str) -> BTreeSet<String> {
    LAYER_NAME
        .captures_iter(content)
        .map(|caps| caps[2].to_string())
        .collect()
}

/// Appends MapServer LAYER blocks for one date.
#[derive(Debug, Clone)]
pub struct MapfileExtender {
    data_prefix: String,
    layers: Vec<LayerType>,
}

impl MapfileExtender {
    pub fn new(data_prefix: impl Into<String>, layers: Vec<LayerType>) -> Self {
        Self {
            data_prefix: data_prefix.into(),
            layers,
        }
    }

    /// `None` when the date is already present.
    pub fn extend(&self, content: &str, date: NaiveDate) -> Option<String> {
        let stamp = date_stamp(date);
        if existing_dates(content).contains(&stamp) {
            return None;
        }
        let trimmed = content.trim_end();
        let body = trimmed.strip_suffix("END").unwrap_or(trimmed);
        let mut out = body.to_string();
        for layer in &self.layers {
            out.push('\n');
            out.push_str(&self.layer_block(layer, date));
        }
        out.push_str("\nEND\n");
        Some(out)
    }

    /// Rewrites the mapfile in place; returns whether anything was added.
    pub fn extend_file(&self, path: &Path, date: NaiveDate) -> Result<bool, SyncError> {
        let content = fs::read_to_string(path)
            .map_err(|err| SyncError::Filesystem(format!("{}: {err}", path.display())))?;
        match self.extend(&content, date) {
            Some(extended) => {
                write_bytes_atomic(path, extended.as_bytes())?;
                info!(path = %path.display(), date = %date, layers = self.layers.len(), "mapfile extended");
                Ok(true)
            }
            None => {
                debug!(path = %path.display(), date = %date, "mapfile already has layers for date");
                Ok(false)
            }
        }
    }

    fn layer_block(&self, layer: &LayerType, date: NaiveDate) -> String {
        let stamp = date_stamp(date);
        let shown = date.format("%Y-%m-%d");
        let title = &layer.title;
        let code = &layer.code;
        let mut block = String::new();
        let _ = write!(
            block,
            r#"  # {title} - {shown}
  LAYER
    NAME "{code}_{stamp}"
    STATUS ON
    TYPE POLYGON
    DATA "{prefix}/{stamp}0000_FPimpacts-{code}"
    TEMPLATE "query"
    PROJECTION
      "init=epsg:4326"
    END
    METADATA
      "wms_title" "{title} - {shown}"
      "wms_enable_request" "*"
      "gml_include_items" "all"
      "wms_include_items" "all"
    END
    CLASSITEM "flood_tot"
    CLASS
      NAME "No Impact"
      EXPRESSION ([flood_tot] = 0)
      STYLE
        COLOR 240 240 240
        OUTLINECOLOR 200 200 200
        WIDTH 0.5
      END
    END
    CLASS
      NAME "Impact"
      EXPRESSION ([flood_tot] > 0)
      STYLE
        COLOR 255 0 0
        OUTLINECOLOR 150 150 150
        WIDTH 0.5
        OPACITY 70
      END
    END
  END"#,
            prefix = self.data_prefix.trim_end_matches('/'),
        );
        block
    }
}
