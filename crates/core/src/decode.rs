//! Result decoding: turn a completed job's payload into a usable artifact.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Serialize;
use serde_json::Value;
use url::Url;

use crate::error::{Result, ToolError};
use crate::fields::FieldAliases;
use crate::tool::ToolKind;

const DEFAULT_IMAGE_MIME: &str = "image/png";
const PBR_ALL_MAPS: &str = "all";

/// Where a tool puts its output. Inline image fields win over URL fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutputSpec {
    pub inline: Option<FieldAliases>,
    pub url: Option<FieldAliases>,
    /// Secondary inline image (e.g. a segmentation mask).
    pub mask: Option<FieldAliases>,
    /// Object of `<map>_path_base64` entries.
    pub map_set: Option<FieldAliases>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodeOptions {
    /// PBR map requested by the caller (`albedo`, `normals`, ..., or `all`).
    pub map_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Artifact {
    InlineImage {
        data: String,
        mime: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        mask: Option<String>,
    },
    Url {
        url: String,
    },
    MapSet {
        maps: BTreeMap<String, String>,
    },
}

impl Artifact {
    /// Browser-displayable form of an inline image.
    pub fn data_url(&self) -> Option<String> {
        match self {
            Artifact::InlineImage { data, mime, .. } => Some(to_data_url(data, mime)),
            _ => None,
        }
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            Artifact::Url { url } => Some(url),
            _ => None,
        }
    }

    /// Raw bytes of an inline image.
    pub fn image_bytes(&self) -> Option<Result<Vec<u8>>> {
        match self {
            Artifact::InlineImage { data, .. } => Some(decode_base64(data)),
            _ => None,
        }
    }

    /// Every embedded image, decoded, with a name suffix: `""` for the main
    /// image, `"mask"` for its mask, the map name for each map of a set.
    pub fn images(&self) -> Result<Vec<(String, Vec<u8>)>> {
        match self {
            Artifact::InlineImage { data, mask, .. } => {
                let mut images = vec![(String::new(), decode_base64(data)?)];
                if let Some(mask) = mask {
                    images.push(("mask".to_string(), decode_base64(strip_data_url(mask))?));
                }
                Ok(images)
            }
            Artifact::Url { .. } => Ok(Vec::new()),
            Artifact::MapSet { maps } => maps
                .iter()
                .map(|(name, data)| Ok((name.clone(), decode_base64(strip_data_url(data))?)))
                .collect(),
        }
    }

    /// One-line description for status messages.
    pub fn summary(&self) -> String {
        match self {
            Artifact::InlineImage { mime, mask, .. } => {
                if mask.is_some() {
                    format!("inline {mime} image with mask")
                } else {
                    format!("inline {mime} image")
                }
            }
            Artifact::Url { url } => url.clone(),
            Artifact::MapSet { maps } => {
                let names: Vec<&str> = maps.keys().map(String::as_str).collect();
                format!("{} maps ({})", maps.len(), names.join(", "))
            }
        }
    }
}

/// Decode the artifact of a completed job.
///
/// `document` is the whole status/runsync body (fields are addressed as
/// `output.*`). Fails with [`ToolError::Decode`] when nothing recognizable is
/// present; upstream shapes drift and that must be visible.
pub fn decode_output(tool: ToolKind, document: &Value, options: &DecodeOptions) -> Result<Artifact> {
    let spec = tool.output_spec();
    let map_type = options
        .map_type
        .as_deref()
        .map(str::trim)
        .filter(|map| !map.is_empty());

    if let (Some(map_set), Some(PBR_ALL_MAPS)) = (spec.map_set, map_type) {
        return decode_map_set(map_set, document);
    }

    if let Some(inline) = spec.inline.and_then(|aliases| aliases.first_str(document)) {
        return inline_artifact(inline, spec.mask.and_then(|aliases| aliases.first_str(document)));
    }

    if let (Some(map_set), Some(map)) = (spec.map_set, map_type) {
        let key = format!("{map}_path_base64");
        if let Some(data) = map_set
            .first_value(document)
            .and_then(|maps| maps.get(&key))
            .and_then(Value::as_str)
            .filter(|data| !data.is_empty())
        {
            return inline_artifact(data, None);
        }
        return Err(ToolError::Decode(format!(
            "could not find base64 image data for map type '{map}'"
        )));
    }

    if let Some(url) = spec.url.and_then(|aliases| aliases.first_str(document)) {
        return Ok(Artifact::Url {
            url: strip_query(url),
        });
    }

    Err(ToolError::Decode(format!(
        "job succeeded but output is missing or has an unexpected shape (looked for: {})",
        describe_spec(&spec)
    )))
}

fn inline_artifact(data: &str, mask: Option<&str>) -> Result<Artifact> {
    let (mime, payload) = split_data_url(data);
    decode_base64(payload)?;
    Ok(Artifact::InlineImage {
        data: payload.to_string(),
        mime: mime.to_string(),
        mask: mask.map(|mask| split_data_url(mask).1.to_string()),
    })
}

fn decode_map_set(map_set: FieldAliases, document: &Value) -> Result<Artifact> {
    let object = map_set
        .first_value(document)
        .and_then(Value::as_object)
        .ok_or_else(|| {
            ToolError::Decode("response for 'all' maps is missing the 'base64_outputs' object".to_string())
        })?;

    let maps: BTreeMap<String, String> = object
        .iter()
        .filter_map(|(key, value)| {
            let name = key.strip_suffix("_path_base64")?;
            let data = value.as_str().filter(|data| !data.is_empty())?;
            Some((name.to_string(), split_data_url(data).1.to_string()))
        })
        .collect();

    if maps.is_empty() {
        return Err(ToolError::Decode(
            "'base64_outputs' contains no map images".to_string(),
        ));
    }
    Ok(Artifact::MapSet { maps })
}

fn describe_spec(spec: &OutputSpec) -> String {
    [spec.inline, spec.map_set, spec.url]
        .into_iter()
        .flatten()
        .map(|aliases| aliases.describe())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Drop the query string (signing parameters) and fragment from a URL.
pub fn strip_query(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) => {
            url.set_query(None);
            url.set_fragment(None);
            url.to_string()
        }
        Err(_) => raw.split(['?', '#']).next().unwrap_or(raw).to_string(),
    }
}

pub fn to_data_url(data: &str, mime: &str) -> String {
    if data.starts_with("data:") {
        data.to_string()
    } else {
        format!("data:{mime};base64,{data}")
    }
}

/// Split `data:<mime>;base64,<payload>` into its parts. Bare base64 is
/// assumed to be PNG.
fn split_data_url(data: &str) -> (&str, &str) {
    data.strip_prefix("data:")
        .and_then(|rest| rest.split_once(','))
        .map(|(header, payload)| {
            let mime = header.split(';').next().filter(|mime| !mime.is_empty());
            (mime.unwrap_or(DEFAULT_IMAGE_MIME), payload)
        })
        .unwrap_or((DEFAULT_IMAGE_MIME, data))
}

fn strip_data_url(data: &str) -> &str {
    match data.strip_prefix("data:").and_then(|rest| rest.split_once(',')) {
        Some((_, payload)) => payload,
        None => data,
    }
}

fn decode_base64(data: &str) -> Result<Vec<u8>> {
    let compact: String = data.chars().filter(|ch| !ch.is_ascii_whitespace()).collect();
    STANDARD
        .decode(compact.as_bytes())
        .map_err(|err| ToolError::Decode(format!("output image is not valid base64: {err}")))
}
