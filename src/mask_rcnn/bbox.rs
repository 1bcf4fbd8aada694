use crate::utils::argsort_desc;

/// Upper bound for the log-space size offsets, keeps `exp` from overflowing.
const BBOX_XFORM_CLIP: f32 = 4.135_166_6; // ln(1000 / 16)

/// Axis aligned box in `(y_min, x_min, y_max, x_max)` order.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct BBox {
    pub y_min: f32,
    pub x_min: f32,
    pub y_max: f32,
    pub x_max: f32,
}

impl BBox {
    pub fn new(y_min: f32, x_min: f32, y_max: f32, x_max: f32) -> Self {
        Self {
            y_min,
            x_min,
            y_max,
            x_max,
        }
    }

    pub fn height(&self) -> f32 {
        self.y_max - self.y_min
    }

    pub fn width(&self) -> f32 {
        self.x_max - self.x_min
    }

    pub fn area(&self) -> f32 {
        self.height().max(0.) * self.width().max(0.)
    }

    pub fn iou(&self, other: &BBox) -> f32 {
        let tl_y = self.y_min.max(other.y_min);
        let tl_x = self.x_min.max(other.x_min);
        let br_y = self.y_max.min(other.y_max);
        let br_x = self.x_max.min(other.x_max);
        let intersection = if tl_y < br_y && tl_x < br_x {
            (br_y - tl_y) * (br_x - tl_x)
        } else {
            0.
        };
        let union = self.area() + other.area() - intersection;
        if union <= 0. {
            0.
        } else {
            intersection / union
        }
    }

    pub fn scale(&self, factor: f32) -> BBox {
        BBox::new(
            self.y_min * factor,
            self.x_min * factor,
            self.y_max * factor,
            self.x_max * factor,
        )
    }

    /// Clips the box into `[0, height] x [0, width]`.
    pub fn clip(&self, height: f32, width: f32) -> BBox {
        BBox::new(
            num_traits::clamp(self.y_min, 0., height),
            num_traits::clamp(self.x_min, 0., width),
            num_traits::clamp(self.y_max, 0., height),
            num_traits::clamp(self.x_max, 0., width),
        )
    }

    /// Applies `(dy, dx, dh, dw)` offsets to this box, treating it as the
    /// source (anchor or proposal) of the encoding.
    pub fn decode(&self, loc: &[f32]) -> BBox {
        let (h, w) = (self.height(), self.width());
        let ctr_y = self.y_min + 0.5 * h;
        let ctr_x = self.x_min + 0.5 * w;
        let (dy, dx) = (loc[0], loc[1]);
        let dh = loc[2].min(BBOX_XFORM_CLIP);
        let dw = loc[3].min(BBOX_XFORM_CLIP);

        let ctr_y = dy * h + ctr_y;
        let ctr_x = dx * w + ctr_x;
        let h = dh.exp() * h;
        let w = dw.exp() * w;
        BBox::new(
            ctr_y - 0.5 * h,
            ctr_x - 0.5 * w,
            ctr_y + 0.5 * h,
            ctr_x + 0.5 * w,
        )
    }
}

/// Greedy non-maximum suppression. Boxes are visited from the highest score
/// down and dropped when they overlap an already selected box with an IoU of
/// `thresh` or more. Returns the selected indices in descending score order.
pub fn non_maximum_suppression(
    bboxes: &[BBox],
    scores: &[f32],
    thresh: f32,
    limit: Option<usize>,
) -> Vec<usize> {
    let limit = limit.unwrap_or(bboxes.len());
    let mut selected: Vec<usize> = Vec::new();
    for i in argsort_desc(scores) {
        if selected.len() >= limit {
            break;
        }
        if selected
            .iter()
            .all(|&j| bboxes[i].iou(&bboxes[j]) < thresh)
        {
            selected.push(i);
        }
    }
    selected
}
