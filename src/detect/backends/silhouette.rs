use crate::detect::backend::DetectorBackend;
use crate::detect::result::{BBox, Candidate};
use crate::error::InferenceError;

/// CPU backend for dark airborne silhouettes against open sky.
///
/// Samples the frame on a coarse grid, marks cells noticeably darker than the mean sky
/// luminance and reports each 4-connected group of dark cells as one candidate.
/// Components covering more than `max_area_ratio` of the frame (horizon, buildings)
/// are ignored.
#[derive(Clone, Debug)]
pub struct SilhouetteBackend {
    cell: u32,
    contrast: f32,
    min_cells: usize,
    max_area_ratio: f32,
}

impl Default for SilhouetteBackend {
    fn default() -> Self {
        Self {
            cell: 4,
            contrast: 50.0,
            min_cells: 2,
            max_area_ratio: 0.25,
        }
    }
}

impl SilhouetteBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

struct Component {
    min_x: usize,
    min_y: usize,
    max_x: usize,
    max_y: usize,
    cells: usize,
    luma_sum: f32,
}

fn luma(pixels: &[u8], idx: usize) -> f32 {
    0.299 * pixels[idx] as f32 + 0.587 * pixels[idx + 1] as f32 + 0.114 * pixels[idx + 2] as f32
}

impl DetectorBackend for SilhouetteBackend {
    fn name(&self) -> &'static str {
        "silhouette"
    }

    fn detect(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<Candidate>, InferenceError> {
        let expected = (width as usize) * (height as usize) * 3;
        if pixels.len() != expected {
            return Err(InferenceError::MalformedFrame(format!(
                "expected {} RGB bytes, received {}",
                expected,
                pixels.len()
            )));
        }

        let cell = self.cell as usize;
        let (w, h) = (width as usize, height as usize);
        let (gw, gh) = (w / cell, h / cell);
        if gw == 0 || gh == 0 {
            return Ok(Vec::new());
        }

        // one luminance sample at the centre of each cell
        let mut grid = vec![0f32; gw * gh];
        for gy in 0..gh {
            for gx in 0..gw {
                let px = gx * cell + cell / 2;
                let py = gy * cell + cell / 2;
                grid[gy * gw + gx] = luma(pixels, (py * w + px) * 3);
            }
        }
        let sky = grid.iter().sum::<f32>() / grid.len() as f32;
        let dark: Vec<bool> = grid.iter().map(|&l| l < sky - self.contrast).collect();

        let mut seen = vec![false; gw * gh];
        let mut stack = Vec::new();
        let mut out = Vec::new();
        let max_cells = (self.max_area_ratio * (gw * gh) as f32) as usize;

        for start in 0..gw * gh {
            if !dark[start] || seen[start] {
                continue;
            }
            seen[start] = true;
            stack.push(start);
            let mut comp = Component {
                min_x: start % gw,
                min_y: start / gw,
                max_x: start % gw,
                max_y: start / gw,
                cells: 0,
                luma_sum: 0.0,
            };

            while let Some(idx) = stack.pop() {
                let (x, y) = (idx % gw, idx / gw);
                comp.cells += 1;
                comp.luma_sum += grid[idx];
                comp.min_x = comp.min_x.min(x);
                comp.min_y = comp.min_y.min(y);
                comp.max_x = comp.max_x.max(x);
                comp.max_y = comp.max_y.max(y);

                let mut visit = |n: usize| {
                    if dark[n] && !seen[n] {
                        seen[n] = true;
                        stack.push(n);
                    }
                };
                if x > 0 {
                    visit(idx - 1);
                }
                if x + 1 < gw {
                    visit(idx + 1);
                }
                if y > 0 {
                    visit(idx - gw);
                }
                if y + 1 < gh {
                    visit(idx + gw);
                }
            }

            if comp.cells < self.min_cells || comp.cells > max_cells {
                continue;
            }

            let box_cells = (comp.max_x - comp.min_x + 1) * (comp.max_y - comp.min_y + 1);
            let fill = comp.cells as f32 / box_cells as f32;
            let mean = comp.luma_sum / comp.cells as f32;
            let contrast = if sky > 0.0 {
                ((sky - mean) / sky).clamp(0.0, 1.0)
            } else {
                0.0
            };
            let confidence = ((0.4 + 0.6 * contrast) * (0.75 + 0.25 * fill)).clamp(0.0, 1.0);

            out.push(Candidate::new(
                BBox::new(
                    (comp.min_x * cell) as f32,
                    (comp.min_y * cell) as f32,
                    ((comp.max_x + 1) * cell) as f32,
                    ((comp.max_y + 1) * cell) as f32,
                ),
                confidence,
            ));
        }

        Ok(out)
    }
}
