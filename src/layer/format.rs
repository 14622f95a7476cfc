//! DRM fourcc pixel formats.

/// Pack a fourcc code the way `drm_fourcc.h` does.
pub const fn fourcc(code: &[u8; 4]) -> u32 {
    (code[0] as u32) | (code[1] as u32) << 8 | (code[2] as u32) << 16 | (code[3] as u32) << 24
}

pub const XRGB8888: u32 = fourcc(b"XR24");
pub const XBGR8888: u32 = fourcc(b"XB24");
pub const ARGB8888: u32 = fourcc(b"AR24");
pub const ABGR8888: u32 = fourcc(b"AB24");
pub const RGB565: u32 = fourcc(b"RG16");
pub const BGR888: u32 = fourcc(b"BG24");
pub const XRGB2101010: u32 = fourcc(b"XR30");
pub const ARGB2101010: u32 = fourcc(b"AR30");

pub const NV12: u32 = fourcc(b"NV12");
pub const NV21: u32 = fourcc(b"NV21");
pub const NV16: u32 = fourcc(b"NV16");
pub const NV61: u32 = fourcc(b"NV61");
pub const YUV420: u32 = fourcc(b"YU12");
pub const YVU420: u32 = fourcc(b"YV12");
pub const YUYV: u32 = fourcc(b"YUYV");
pub const UYVY: u32 = fourcc(b"UYVY");
pub const P010: u32 = fourcc(b"P010");

const YUV_FORMATS: [u32; 9] = [NV12, NV21, NV16, NV61, YUV420, YVU420, YUYV, UYVY, P010];

/// Whether the format stores RGB samples. YCbCr formats need COLOR_ENCODING and COLOR_RANGE.
pub fn is_rgb(format: u32) -> bool {
    !YUV_FORMATS.contains(&format)
}

/// Human-readable fourcc, e.g. `XR24`.
pub fn fourcc_name(format: u32) -> String {
    format
        .to_le_bytes()
        .iter()
        .map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '?'
            }
        })
        .collect()
}

/// Parse a four-character code as written in hardware descriptions.
pub fn parse_fourcc(name: &str) -> Option<u32> {
    let bytes: [u8; 4] = name.as_bytes().try_into().ok()?;
    Some(fourcc(&bytes))
}
