//! Face crop normalization ahead of embedding.
//!
//! With landmarks, the face is warped onto the canonical ArcFace template by
//! a closed-form least-squares similarity transform. Without landmarks the
//! detection box is cropped and resized.

use crate::types::BoundingBox;

/// Side of the square crop fed to the embedder.
pub const ALIGNED_SIZE: usize = 112;

/// ArcFace template landmarks for a 112×112 crop.
const TEMPLATE_112: [(f32, f32); 5] = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

/// Similarity transform `dst = s·R·src + t`, stored as `(a, b, tx, ty)` with
/// `a = s·cosθ`, `b = s·sinθ`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    /// Least-squares fit between two point sets (Umeyama without reflection).
    fn fit(src: &[(f32, f32)], dst: &[(f32, f32)]) -> Option<Self> {
        let n = src.len().min(dst.len());
        if n < 2 {
            return None;
        }
        let nf = n as f32;
        let mean = |pts: &[(f32, f32)]| {
            let (sx, sy) = pts[..n]
                .iter()
                .fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
            (sx / nf, sy / nf)
        };
        let (smx, smy) = mean(src);
        let (dmx, dmy) = mean(dst);

        let mut dot = 0.0f32;
        let mut cross = 0.0f32;
        let mut var = 0.0f32;
        for i in 0..n {
            let (sx, sy) = (src[i].0 - smx, src[i].1 - smy);
            let (dx, dy) = (dst[i].0 - dmx, dst[i].1 - dmy);
            dot += sx * dx + sy * dy;
            cross += sx * dy - sy * dx;
            var += sx * sx + sy * sy;
        }
        if var < 1e-9 {
            return None;
        }

        let a = dot / var;
        let b = cross / var;
        Some(Self {
            a,
            b,
            tx: dmx - (a * smx - b * smy),
            ty: dmy - (b * smx + a * smy),
        })
    }

    fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        )
    }

    fn inverse(&self) -> Option<Self> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let ia = self.a / det;
        let ib = -self.b / det;
        Some(Self {
            a: ia,
            b: ib,
            tx: -(ia * self.tx - ib * self.ty),
            ty: -(ib * self.tx + ia * self.ty),
        })
    }
}

/// Bilinear sample of a luma plane; out-of-bounds reads are black.
fn sample(frame: &[u8], width: usize, height: usize, x: f32, y: f32) -> u8 {
    let x0 = x.floor() as i64;
    let y0 = y.floor() as i64;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let px = |xx: i64, yy: i64| -> f32 {
        if xx >= 0 && yy >= 0 && (xx as usize) < width && (yy as usize) < height {
            frame
                .get(yy as usize * width + xx as usize)
                .copied()
                .unwrap_or(0) as f32
        } else {
            0.0
        }
    };

    let top = px(x0, y0) * (1.0 - fx) + px(x0 + 1, y0) * fx;
    let bottom = px(x0, y0 + 1) * (1.0 - fx) + px(x0 + 1, y0 + 1) * fx;
    (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8
}

/// Render `size × size` output pixels, mapping each back into the source frame.
fn render<F>(frame: &[u8], width: u32, height: u32, size: usize, to_src: F) -> Vec<u8>
where
    F: Fn(f32, f32) -> (f32, f32),
{
    let (w, h) = (width as usize, height as usize);
    let mut out = vec![0u8; size * size];
    for oy in 0..size {
        for ox in 0..size {
            let (sx, sy) = to_src(ox as f32, oy as f32);
            out[oy * size + ox] = sample(frame, w, h, sx, sy);
        }
    }
    out
}

/// Warp a face onto the 112×112 template using its five landmarks.
///
/// Degenerate landmark sets fall back to [`crop_resize`].
pub fn align_face(frame: &[u8], width: u32, height: u32, face: &BoundingBox) -> Vec<u8> {
    let inverse = face
        .landmarks
        .as_ref()
        .and_then(|lms| Similarity::fit(lms, &TEMPLATE_112))
        .and_then(|t| t.inverse());

    match inverse {
        Some(inv) => render(frame, width, height, ALIGNED_SIZE, |x, y| inv.apply((x, y))),
        None => crop_resize(frame, width, height, face, ALIGNED_SIZE),
    }
}

/// Crop the detection box and resize it to `size × size`.
pub fn crop_resize(frame: &[u8], width: u32, height: u32, face: &BoundingBox, size: usize) -> Vec<u8> {
    let sx = face.width() / size as f32;
    let sy = face.height() / size as f32;
    render(frame, width, height, size, |x, y| {
        (face.x1 + (x + 0.5) * sx - 0.5, face.y1 + (y + 0.5) * sy - 0.5)
    })
}
