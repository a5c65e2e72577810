//! Classical fiducial detector: threshold, connected dark components, quad
//! corner fitting, homography sampling of the code grid, dictionary match.
//! No learned perception; the whole pipeline is deterministic.

use crate::types::CameraFrame;
use nalgebra::{DMatrix, DVector};

/// A square marker family: `grid` data bits per side plus a one-cell black
/// border, and the code dictionary indexed by marker id.
#[derive(Clone, Debug)]
pub struct TagFamily {
    pub name: &'static str,
    /// Data bits per side (4 for the 16-bit family).
    pub grid: usize,
    /// Correctable Hamming distance.
    pub max_hamming: u32,
    pub codes: Vec<u64>,
}

impl TagFamily {
    /// The standard 16h5 dictionary: 4x4 data bits, 30 codes, min Hamming
    /// distance 5.
    pub fn tag16h5() -> TagFamily {
        TagFamily {
            name: "tag16h5",
            grid: 4,
            max_hamming: 1,
            codes: vec![
                0x231b, 0x2ea5, 0x346a, 0x45b9, 0x79a6, 0x7f6b, 0xb358, 0xe745, 0xfe59, 0x156d,
                0x380b, 0xf0ab, 0x0d84, 0x4736, 0x8c72, 0xaf10, 0x093c, 0x93b4, 0xa503, 0x468f,
                0xe137, 0x5795, 0xdf42, 0x1c1d, 0xe9dc, 0x73ad, 0xad5f, 0xd530, 0x07ca, 0xaf2e,
            ],
        }
    }

    /// Rotate a code 90 degrees for rotation-invariant matching.
    fn rotate(&self, code: u64) -> u64 {
        let n = self.grid;
        let mut out = 0u64;
        for row in 0..n {
            for col in 0..n {
                let bit = (code >> (n * n - 1 - (row * n + col))) & 1;
                // (row, col) -> (col, n-1-row)
                let (nr, nc) = (col, n - 1 - row);
                out |= bit << (n * n - 1 - (nr * n + nc));
            }
        }
        out
    }

    /// Best dictionary match over all four rotations. Returns
    /// (id, hamming) when within the correctable distance.
    pub fn decode(&self, mut observed: u64) -> Option<(u32, u32)> {
        let mut best: Option<(u32, u32)> = None;
        for _rotation in 0..4 {
            for (id, &code) in self.codes.iter().enumerate() {
                let hamming = (observed ^ code).count_ones();
                if hamming <= self.max_hamming
                    && best.map(|(_, bh)| hamming < bh).unwrap_or(true)
                {
                    best = Some((id as u32, hamming));
                }
            }
            observed = self.rotate(observed);
        }
        best
    }
}

/// Raw quad detection before pose estimation. Corners are ordered
/// counter-clockwise starting at the top-left, in undistorted pixels.
#[derive(Clone, Debug)]
pub struct QuadDetection {
    pub id: u32,
    pub corners: [(f64, f64); 4],
    pub perimeter_px: f64,
    /// Decode quality in [0, 1]: bit margin discounted by Hamming errors.
    pub confidence: f64,
}

pub struct QuadDetector {
    family: TagFamily,
    /// Components smaller than this many pixels are noise.
    min_component_px: usize,
}

impl QuadDetector {
    pub fn new(family: TagFamily) -> Self {
        QuadDetector {
            family,
            min_component_px: 64,
        }
    }

    pub fn family(&self) -> &TagFamily {
        &self.family
    }

    /// Detect and decode every marker candidate in a frame.
    pub fn detect(&self, frame: &CameraFrame) -> Vec<QuadDetection> {
        let threshold = mean_threshold(frame);
        let components = dark_components(frame, threshold, self.min_component_px);

        let mut detections = Vec::new();
        for component in components {
            let Some(corners) = fit_quad(&component) else {
                continue;
            };
            let Some((code, margin)) = self.sample_code(frame, &corners, threshold) else {
                continue;
            };
            let Some((id, hamming)) = self.family.decode(code) else {
                continue;
            };
            let perimeter_px = perimeter(&corners);
            let confidence =
                (margin * (1.0 - hamming as f64 / (self.family.max_hamming as f64 + 1.0)))
                    .clamp(0.0, 1.0);
            detections.push(QuadDetection {
                id,
                corners,
                perimeter_px,
                confidence,
            });
        }
        detections
    }

    /// Sample the (grid+2)^2 cell lattice through the quad homography.
    /// Returns the observed code and the black/white separation margin, or
    /// None when the border is not black.
    fn sample_code(
        &self,
        frame: &CameraFrame,
        corners: &[(f64, f64); 4],
        threshold: f64,
    ) -> Option<(u64, f64)> {
        let h = homography_from_unit_square(corners)?;
        let cells = self.family.grid + 2;
        let mut code = 0u64;
        let mut border_dark = 0usize;
        let mut border_total = 0usize;
        let mut min_sep = f64::INFINITY;

        for row in 0..cells {
            for col in 0..cells {
                let u = (col as f64 + 0.5) / cells as f64;
                let v = (row as f64 + 0.5) / cells as f64;
                let (px, py) = apply_homography(&h, u, v);
                let value = sample_bilinear(frame, px, py)?;
                let dark = value < threshold;
                min_sep = min_sep.min((value - threshold).abs() / 255.0);

                let on_border = row == 0 || col == 0 || row == cells - 1 || col == cells - 1;
                if on_border {
                    border_total += 1;
                    if dark {
                        border_dark += 1;
                    }
                } else {
                    let bit = u64::from(!dark);
                    code = (code << 1) | bit;
                }
            }
        }

        // The border must be essentially all black.
        if border_dark * 10 < border_total * 9 {
            return None;
        }
        Some((code, (min_sep * 4.0).min(1.0)))
    }
}

fn perimeter(corners: &[(f64, f64); 4]) -> f64 {
    (0..4)
        .map(|i| {
            let (ax, ay) = corners[i];
            let (bx, by) = corners[(i + 1) % 4];
            ((bx - ax).powi(2) + (by - ay).powi(2)).sqrt()
        })
        .sum()
}

fn mean_threshold(frame: &CameraFrame) -> f64 {
    let sum: u64 = frame.data.iter().map(|&p| p as u64).sum();
    let mean = sum as f64 / frame.data.len() as f64;
    // Bias toward dark so gray backgrounds do not fragment the border.
    mean * 0.75
}

/// Flood-fill dark connected components (4-connectivity), returning the
/// pixel sets of sufficiently large ones.
fn dark_components(
    frame: &CameraFrame,
    threshold: f64,
    min_px: usize,
) -> Vec<Vec<(usize, usize)>> {
    let (w, h) = (frame.width, frame.height);
    let mut visited = vec![false; w * h];
    let mut out = Vec::new();

    for start_y in 0..h {
        for start_x in 0..w {
            let idx = start_y * w + start_x;
            if visited[idx] || frame.pixel(start_x, start_y) as f64 >= threshold {
                continue;
            }
            let mut component = Vec::new();
            let mut stack = vec![(start_x, start_y)];
            visited[idx] = true;
            while let Some((x, y)) = stack.pop() {
                component.push((x, y));
                for (dx, dy) in [(1i64, 0i64), (-1, 0), (0, 1), (0, -1)] {
                    let (nx, ny) = (x as i64 + dx, y as i64 + dy);
                    if nx < 0 || ny < 0 || nx >= w as i64 || ny >= h as i64 {
                        continue;
                    }
                    let (nx, ny) = (nx as usize, ny as usize);
                    let nidx = ny * w + nx;
                    if !visited[nidx] && (frame.pixel(nx, ny) as f64) < threshold {
                        visited[nidx] = true;
                        stack.push((nx, ny));
                    }
                }
            }
            if component.len() >= min_px {
                out.push(component);
            }
        }
    }
    out
}

/// Fit four corners to a component: farthest pair, then the extreme point on
/// each side of that diagonal. Corners come back ordered counter-clockwise.
fn fit_quad(component: &[(usize, usize)]) -> Option<[(f64, f64); 4]> {
    if component.len() < 4 {
        return None;
    }
    let pts: Vec<(f64, f64)> = component.iter().map(|&(x, y)| (x as f64, y as f64)).collect();

    // Farthest pair (diagonal). Components are border-shaped, so scanning
    // extremes first keeps this cheap.
    let mut a = 0;
    let mut b = 0;
    let mut best = -1.0;
    let candidates = extreme_points(&pts);
    for &i in &candidates {
        for &j in &candidates {
            let d = dist2(pts[i], pts[j]);
            if d > best {
                best = d;
                a = i;
                b = j;
            }
        }
    }
    if best <= 0.0 {
        return None;
    }

    // Extreme points on each side of the diagonal.
    let (ax, ay) = pts[a];
    let (bx, by) = pts[b];
    let (mut c, mut d) = (None, None);
    let (mut best_pos, mut best_neg) = (1e-9, -1e-9);
    for (i, &(px, py)) in pts.iter().enumerate() {
        let cross = (bx - ax) * (py - ay) - (by - ay) * (px - ax);
        if cross > best_pos {
            best_pos = cross;
            c = Some(i);
        } else if cross < best_neg {
            best_neg = cross;
            d = Some(i);
        }
    }
    let (c, d) = (c?, d?);

    let mut quad = [pts[a], pts[c], pts[b], pts[d]];
    order_ccw(&mut quad);
    Some(quad)
}

/// A spread of boundary-extreme points used to seed the diagonal search.
fn extreme_points(pts: &[(f64, f64)]) -> Vec<usize> {
    let scores: [fn((f64, f64)) -> f64; 8] = [
        |(x, _)| x,
        |(x, _)| -x,
        |(_, y)| y,
        |(_, y)| -y,
        |(x, y)| x + y,
        |(x, y)| x - y,
        |(x, y)| -x + y,
        |(x, y)| -x - y,
    ];
    scores
        .iter()
        .map(|score| {
            let mut best = 0;
            let mut best_s = f64::NEG_INFINITY;
            for (i, &p) in pts.iter().enumerate() {
                let s = score(p);
                if s > best_s {
                    best_s = s;
                    best = i;
                }
            }
            best
        })
        .collect()
}

fn dist2(a: (f64, f64), b: (f64, f64)) -> f64 {
    (a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)
}

fn order_ccw(quad: &mut [(f64, f64); 4]) {
    let cx = quad.iter().map(|p| p.0).sum::<f64>() / 4.0;
    let cy = quad.iter().map(|p| p.1).sum::<f64>() / 4.0;
    quad.sort_by(|p, q| {
        let pa = (p.1 - cy).atan2(p.0 - cx);
        let qa = (q.1 - cy).atan2(q.0 - cx);
        pa.partial_cmp(&qa).unwrap_or(std::cmp::Ordering::Equal)
    });
}

/// Direct linear transform from the unit square to the quad.
fn homography_from_unit_square(corners: &[(f64, f64); 4]) -> Option<[f64; 9]> {
    let src = [(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)];
    let mut a = DMatrix::<f64>::zeros(8, 8);
    let mut b = DVector::<f64>::zeros(8);
    for i in 0..4 {
        let (u, v) = src[i];
        let (x, y) = corners[i];
        a[(2 * i, 0)] = u;
        a[(2 * i, 1)] = v;
        a[(2 * i, 2)] = 1.0;
        a[(2 * i, 6)] = -u * x;
        a[(2 * i, 7)] = -v * x;
        b[2 * i] = x;
        a[(2 * i + 1, 3)] = u;
        a[(2 * i + 1, 4)] = v;
        a[(2 * i + 1, 5)] = 1.0;
        a[(2 * i + 1, 6)] = -u * y;
        a[(2 * i + 1, 7)] = -v * y;
        b[2 * i + 1] = y;
    }
    let solution = a.lu().solve(&b)?;
    Some([
        solution[0], solution[1], solution[2], //
        solution[3], solution[4], solution[5], //
        solution[6], solution[7], 1.0,
    ])
}

fn apply_homography(h: &[f64; 9], u: f64, v: f64) -> (f64, f64) {
    let w = h[6] * u + h[7] * v + h[8];
    (
        (h[0] * u + h[1] * v + h[2]) / w,
        (h[3] * u + h[4] * v + h[5]) / w,
    )
}

fn sample_bilinear(frame: &CameraFrame, x: f64, y: f64) -> Option<f64> {
    if x < 0.0 || y < 0.0 || x >= (frame.width - 1) as f64 || y >= (frame.height - 1) as f64 {
        return None;
    }
    let x0 = x.floor() as usize;
    let y0 = y.floor() as usize;
    let fx = x - x0 as f64;
    let fy = y - y0 as f64;
    let p00 = frame.pixel(x0, y0) as f64;
    let p10 = frame.pixel(x0 + 1, y0) as f64;
    let p01 = frame.pixel(x0, y0 + 1) as f64;
    let p11 = frame.pixel(x0 + 1, y0 + 1) as f64;
    Some(
        p00 * (1.0 - fx) * (1.0 - fy)
            + p10 * fx * (1.0 - fy)
            + p01 * (1.0 - fx) * fy
            + p11 * fx * fy,
    )
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Arc;

    /// Render a marker into a white frame: black border plus the code grid,
    /// axis-aligned, `side_px` pixels per marker side.
    pub fn render_tag(
        family: &TagFamily,
        id: u32,
        left: usize,
        top: usize,
        side_px: usize,
        width: usize,
        height: usize,
        timestamp: f64,
    ) -> CameraFrame {
        let code = family.codes[id as usize];
        let cells = family.grid + 2;
        let mut data = vec![230u8; width * height];
        for py in 0..side_px {
            for px in 0..side_px {
                let row = py * cells / side_px;
                let col = px * cells / side_px;
                let on_border =
                    row == 0 || col == 0 || row == cells - 1 || col == cells - 1;
                let dark = if on_border {
                    true
                } else {
                    let bit_index = (row - 1) * family.grid + (col - 1);
                    let bit =
                        (code >> (family.grid * family.grid - 1 - bit_index)) & 1;
                    bit == 0
                };
                if dark {
                    data[(top + py) * width + (left + px)] = 15;
                }
            }
        }
        CameraFrame {
            timestamp,
            width,
            height,
            data: Arc::new(data),
        }
    }
}
