//! Frame sequences described in JSON, for driving a virtual device.
//!
//! ```json
//! { "frames": [
//!     [ { "display": 0, "layers": [
//!         { "buffer": 1, "size": [1920, 1080] },
//!         { "buffer": 2, "size": [640, 480], "format": "NV12", "frame": [100, 100, 740, 580] }
//!     ] } ]
//! ] }
//! ```

use anyhow::{bail, Context};
use serde::Deserialize;

use crate::compositor::DisplayFrame;
use crate::layer::{
    format, Blending, BufferInfo, ColorSpace, Layer, Rect, RectF, SampleRange, Transform,
    ALPHA_OPAQUE,
};

/// Buffer ids from here on are reserved for generated client targets.
const CLIENT_TARGET_ID_BASE: u64 = 1 << 48;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scene {
    /// Each frame lists the displays it updates.
    pub frames: Vec<Vec<DisplayFrameDesc>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DisplayFrameDesc {
    pub display: u32,
    /// Bottom first.
    pub layers: Vec<LayerDesc>,
    /// Size of the client target. Defaults to the bounding box of the layers.
    #[serde(default)]
    pub client_target: Option<[u32; 2]>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LayerDesc {
    pub buffer: u64,
    pub size: [u32; 2],
    #[serde(default = "default_format")]
    pub format: String,
    /// `[left, top, right, bottom]` on the display. Defaults to the buffer size at the origin.
    #[serde(default)]
    pub frame: Option<[i32; 4]>,
    /// `[left, top, right, bottom]` in the buffer. Defaults to the whole buffer.
    #[serde(default)]
    pub crop: Option<[f32; 4]>,
    /// Any of `flip-h`, `flip-v`, `rotate-90`, `rotate-180`, `rotate-270`.
    #[serde(default)]
    pub transform: Vec<String>,
    #[serde(default = "default_alpha")]
    pub alpha: u16,
    #[serde(default)]
    pub blending: Blending,
    #[serde(default)]
    pub color_space: ColorSpace,
    #[serde(default)]
    pub sample_range: SampleRange,
    #[serde(default)]
    pub protected: bool,
}

fn default_format() -> String {
    String::from("XR24")
}

fn default_alpha() -> u16 {
    ALPHA_OPAQUE
}

impl Scene {
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// Turn every frame of the scene into the layers handed to the frame cycle.
    pub fn display_frames(&self) -> anyhow::Result<Vec<Vec<DisplayFrame>>> {
        self.frames
            .iter()
            .enumerate()
            .map(|(i, frame)| {
                frame
                    .iter()
                    .map(DisplayFrameDesc::to_frame)
                    .collect::<anyhow::Result<Vec<_>>>()
                    .with_context(|| format!("error in frame {i}"))
            })
            .collect()
    }
}

impl DisplayFrameDesc {
    fn to_frame(&self) -> anyhow::Result<DisplayFrame> {
        let layers = self
            .layers
            .iter()
            .enumerate()
            .map(|(z, desc)| {
                let mut layer = desc.to_layer()?;
                layer.z_order = z as u32;
                Ok(layer)
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let [width, height] = match self.client_target {
            Some(size) => size,
            None => {
                let right = layers.iter().map(|l| l.display_frame.right).max().unwrap_or(0);
                let bottom = layers.iter().map(|l| l.display_frame.bottom).max().unwrap_or(0);
                [right.max(0) as u32, bottom.max(0) as u32]
            }
        };

        let client_target = (width > 0 && height > 0).then(|| {
            let buffer = buffer_info(
                CLIENT_TARGET_ID_BASE + u64::from(self.display),
                width,
                height,
                format::ARGB8888,
            );
            let mut target = Layer::new(buffer, Rect::from_size(width as i32, height as i32));
            target.blending = Blending::PreMult;
            target
        });

        Ok(DisplayFrame {
            display: self.display,
            layers,
            client_target,
        })
    }
}

impl LayerDesc {
    fn to_layer(&self) -> anyhow::Result<Layer> {
        if self.buffer >= CLIENT_TARGET_ID_BASE {
            bail!("buffer id {} is reserved", self.buffer);
        }
        let format = format::parse_fourcc(&self.format)
            .with_context(|| format!("invalid format {:?}", self.format))?;

        let [width, height] = self.size;
        let frame = match self.frame {
            Some([l, t, r, b]) => Rect::new(l, t, r, b),
            None => Rect::from_size(width as i32, height as i32),
        };

        let mut layer = Layer::new(buffer_info(self.buffer, width, height, format), frame);
        if let Some([l, t, r, b]) = self.crop {
            layer.source_crop = RectF::new(l, t, r, b);
        }
        layer.transform = parse_transform(&self.transform)?;
        layer.alpha = self.alpha;
        layer.blending = self.blending;
        layer.color_space = self.color_space;
        layer.sample_range = self.sample_range;
        layer.protected = self.protected;
        Ok(layer)
    }
}

fn buffer_info(id: u64, width: u32, height: u32, format: u32) -> BufferInfo {
    let bpp = if format::is_rgb(format) { 4 } else { 1 };
    BufferInfo {
        id,
        width,
        height,
        format,
        pitches: [width * bpp, 0, 0, 0],
        offsets: [0; 4],
        handles: [(id & 0xffff_ffff) as u32, 0, 0, 0],
        modifiers: [0; 4],
    }
}

fn parse_transform(names: &[String]) -> anyhow::Result<Transform> {
    names.iter().try_fold(Transform::IDENTITY, |acc, name| {
        let flag = match name.as_str() {
            "flip-h" => Transform::FLIP_H,
            "flip-v" => Transform::FLIP_V,
            "rotate-90" => Transform::ROTATE_90,
            "rotate-180" => Transform::ROTATE_180,
            "rotate-270" => Transform::ROTATE_270,
            _ => bail!("unknown transform {name:?}"),
        };
        Ok(acc | flag)
    })
}

#[cfg(test)]
mod tests {
    use insta::assert_debug_snapshot;

    use super::*;

    #[test]
    fn layers_get_defaults() {
        let scene = Scene::from_json(
            r#"{ "frames": [[ { "display": 0, "layers": [
                { "buffer": 1, "size": [64, 32] },
                { "buffer": 2, "size": [16, 16], "frame": [8, 8, 40, 40],
                  "transform": ["flip-h", "rotate-90"], "alpha": 32768 }
            ] } ]] }"#,
        )
        .unwrap();

        let frames = scene.display_frames().unwrap();
        let frame = &frames[0][0];
        let summary: Vec<_> = frame
            .layers
            .iter()
            .map(|l| (l.z_order, l.display_frame, l.transform, l.alpha))
            .collect();
        assert_debug_snapshot!(summary, @r#"
        [
            (
                0,
                Rect {
                    left: 0,
                    top: 0,
                    right: 64,
                    bottom: 32,
                },
                Transform(
                    0x0,
                ),
                65535,
            ),
            (
                1,
                Rect {
                    left: 8,
                    top: 8,
                    right: 40,
                    bottom: 40,
                },
                Transform(
                    FLIP_H | ROTATE_90,
                ),
                32768,
            ),
        ]
        "#);

        let target = frame.client_target.as_ref().unwrap();
        assert_eq!(target.display_frame, Rect::from_size(64, 40));
    }

    #[test]
    fn unknown_transform_is_an_error() {
        let scene = Scene::from_json(
            r#"{ "frames": [[ { "display": 0, "layers": [
                { "buffer": 1, "size": [64, 32], "transform": ["spin"] }
            ] } ]] }"#,
        )
        .unwrap();
        assert!(scene.display_frames().is_err());
    }

    #[test]
    fn bad_format_is_an_error() {
        let scene = Scene::from_json(
            r#"{ "frames": [[ { "display": 0, "layers": [
                { "buffer": 1, "size": [64, 32], "format": "RGBAX" }
            ] } ]] }"#,
        )
        .unwrap();
        assert!(scene.display_frames().is_err());
    }
}
