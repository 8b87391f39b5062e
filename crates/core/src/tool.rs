//! The catalog of inference tools and their per-tool wiring.

use std::fmt;

use serde::Serialize;

use crate::decode::OutputSpec;
use crate::fields::FieldAliases;
use crate::job::JobMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolKind {
    WallPainting,
    WallPaintingV2,
    ClothesSwapper,
    ImageComposition,
    PbrMapGenerator,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ToolDescriptor {
    pub id: String,
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    /// Proxy route, or `None` for entries that are not job-based.
    pub api_path: Option<String>,
    pub page_path: String,
}

impl ToolKind {
    pub const ALL: [ToolKind; 5] = [
        ToolKind::WallPainting,
        ToolKind::WallPaintingV2,
        ToolKind::ClothesSwapper,
        ToolKind::ImageComposition,
        ToolKind::PbrMapGenerator,
    ];

    /// Route segment under `/api/`.
    pub fn slug(self) -> &'static str {
        match self {
            ToolKind::WallPainting => "magic-paint",
            ToolKind::WallPaintingV2 => "wall-painting-v2",
            ToolKind::ClothesSwapper => "clothes-swapper",
            ToolKind::ImageComposition => "image-composition",
            ToolKind::PbrMapGenerator => "pbr-map-generator",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        let slug = slug.trim().to_ascii_lowercase();
        match slug.as_str() {
            // The wall-painting page is served as `wall-painting` but its
            // API route has always been `magic-paint`.
            "magic-paint" | "wall-painting" => Some(ToolKind::WallPainting),
            _ => Self::ALL.into_iter().find(|kind| kind.slug() == slug),
        }
    }

    /// Environment variable holding the compute endpoint base URL.
    pub fn endpoint_env(self) -> &'static str {
        match self {
            ToolKind::WallPainting => "RUNPOD_ENDPOINT_WALLPAINT",
            ToolKind::WallPaintingV2 => "RUNPOD_ENDPOINT_WALLPAINT_V2",
            ToolKind::ClothesSwapper => "RUNPOD_ENDPOINT_CLOTHES",
            ToolKind::ImageComposition => "RUNPOD_ENDPOINT_COMPOSITION",
            ToolKind::PbrMapGenerator => "RUNPOD_ENDPOINT_PBRMAP",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            ToolKind::WallPainting => "Wall Painting",
            ToolKind::WallPaintingV2 => "Wall Painting v2",
            ToolKind::ClothesSwapper => "Clothes Swapper",
            ToolKind::ImageComposition => "Image Composition",
            ToolKind::PbrMapGenerator => "PBR Map Generator",
        }
    }

    /// Mode used when a run envelope does not name an endpoint.
    pub fn default_mode(self) -> JobMode {
        match self {
            ToolKind::WallPainting | ToolKind::WallPaintingV2 => JobMode::Async,
            ToolKind::ClothesSwapper
            | ToolKind::ImageComposition
            | ToolKind::PbrMapGenerator => JobMode::Sync,
        }
    }

    /// Whether inputs travel as uploaded files (signed URLs) rather than
    /// inline base64 in the payload.
    pub fn needs_upload(self) -> bool {
        matches!(
            self,
            ToolKind::WallPainting | ToolKind::WallPaintingV2 | ToolKind::PbrMapGenerator
        )
    }

    /// Whether the job writes its result into a pre-signed output slot.
    pub fn reserves_output_slot(self) -> bool {
        matches!(self, ToolKind::WallPainting | ToolKind::WallPaintingV2)
    }

    pub fn output_spec(self) -> OutputSpec {
        match self {
            ToolKind::WallPainting => OutputSpec {
                url: Some(WALL_PAINTING_URL),
                ..OutputSpec::default()
            },
            ToolKind::WallPaintingV2 => OutputSpec {
                url: Some(WALL_PAINTING_V2_URL),
                ..OutputSpec::default()
            },
            ToolKind::ClothesSwapper => OutputSpec {
                inline: Some(CLOTHES_SWAPPER_IMAGE),
                mask: Some(CLOTHES_SWAPPER_MASK),
                ..OutputSpec::default()
            },
            ToolKind::ImageComposition => OutputSpec {
                inline: Some(COMPOSITION_IMAGE),
                ..OutputSpec::default()
            },
            ToolKind::PbrMapGenerator => OutputSpec {
                inline: Some(PBR_SINGLE_MAP),
                map_set: Some(PBR_MAP_SET),
                ..OutputSpec::default()
            },
        }
    }

    pub fn descriptor(self) -> ToolDescriptor {
        let (description, tags): (&str, &[&str]) = match self {
            ToolKind::WallPainting => (
                "Repaint the walls of a room photo with a chosen color.",
                &["interior", "inpainting", "async"],
            ),
            ToolKind::WallPaintingV2 => (
                "Place color patches on a room photo and let the model repaint the marked walls.",
                &["interior", "inpainting", "async"],
            ),
            ToolKind::ClothesSwapper => (
                "Virtual try-on: dress a person image in a garment image.",
                &["fashion", "try-on"],
            ),
            ToolKind::ImageComposition => (
                "Blend a foreground object into a background scene.",
                &["composition", "editing"],
            ),
            ToolKind::PbrMapGenerator => (
                "Generate albedo, normal, roughness, metalness and depth maps from a texture photo.",
                &["3d", "materials"],
            ),
        };

        ToolDescriptor {
            id: self.slug().to_string(),
            title: self.title().to_string(),
            description: description.to_string(),
            tags: tags.iter().map(|tag| tag.to_string()).collect(),
            api_path: Some(format!("/api/{}", self.slug())),
            page_path: format!("/models/{}", self.page_slug()),
        }
    }

    fn page_slug(self) -> &'static str {
        match self {
            ToolKind::WallPainting => "wall-painting",
            other => other.slug(),
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

/// Full dashboard catalog: every job tool plus the real-time agent.
pub fn catalog() -> Vec<ToolDescriptor> {
    let mut entries: Vec<ToolDescriptor> = ToolKind::ALL.iter().map(|kind| kind.descriptor()).collect();
    entries.push(ToolDescriptor {
        id: "livekit-agent".to_string(),
        title: "Interactive Avatar".to_string(),
        description: "Talk to a real-time voice and video agent.".to_string(),
        tags: vec!["realtime".to_string(), "voice".to_string(), "video".to_string()],
        api_path: None,
        page_path: "/models/livekit-agent".to_string(),
    });
    entries
}

const WALL_PAINTING_URL: FieldAliases =
    FieldAliases::new("output_url", &[&["output", "output_url"]]);

const WALL_PAINTING_V2_URL: FieldAliases = FieldAliases::new(
    "output_url",
    &[&["output", "data", "output_url"], &["output", "output_url"]],
);

const CLOTHES_SWAPPER_IMAGE: FieldAliases = FieldAliases::new(
    "result_image",
    &[
        &["output", "result_image_base64"],
        &["output", "image_base64"],
        &["output", "output"],
    ],
);

const CLOTHES_SWAPPER_MASK: FieldAliases =
    FieldAliases::new("mask_image", &[&["output", "mask_image_base64"]]);

const COMPOSITION_IMAGE: FieldAliases =
    FieldAliases::new("processed_image", &[&["output", "processed_image"]]);

const PBR_SINGLE_MAP: FieldAliases = FieldAliases::new(
    "output_path_base64",
    &[&["output", "result", "output_path_base64"]],
);

const PBR_MAP_SET: FieldAliases = FieldAliases::new(
    "base64_outputs",
    &[&["output", "result", "base64_outputs"]],
);
