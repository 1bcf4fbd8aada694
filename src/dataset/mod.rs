pub mod transform;
pub mod voc;

use crate::mask_rcnn::bbox::BBox;
use anyhow::{anyhow, Result};
use image::{GrayImage, RgbImage};

#[derive(Debug, Clone)]
pub struct InstanceAnnotation {
    pub bbox: BBox,
    /// Image sized, non-zero where the instance is.
    pub mask: GrayImage,
    /// 0-based foreground class.
    pub label: usize,
}

#[derive(Debug, Clone)]
pub struct InstanceSegmentationExample {
    pub image: RgbImage,
    pub instances: Vec<InstanceAnnotation>,
}

/// Random access collection of examples.
pub trait Dataset {
    type Item;

    fn len(&self) -> usize;

    fn get_example(&self, index: usize) -> Result<Self::Item>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<D: Dataset + ?Sized> Dataset for &D {
    type Item = D::Item;

    fn len(&self) -> usize {
        (**self).len()
    }

    fn get_example(&self, index: usize) -> Result<Self::Item> {
        (**self).get_example(index)
    }
}

/// View of a dataset restricted to the given indices, in the given order.
pub struct IndexingDataset<D> {
    dataset: D,
    indices: Vec<usize>,
}

impl<D: Dataset> IndexingDataset<D> {
    pub fn new(dataset: D, indices: Vec<usize>) -> Result<Self> {
        if let Some(index) = indices.iter().find(|&&i| i >= dataset.len()) {
            return Err(anyhow!(
                "Index {} is out of range for a dataset of {} examples",
                index,
                dataset.len()
            ));
        }
        Ok(Self { dataset, indices })
    }
}

impl<D: Dataset> Dataset for IndexingDataset<D> {
    type Item = D::Item;

    fn len(&self) -> usize {
        self.indices.len()
    }

    fn get_example(&self, index: usize) -> Result<Self::Item> {
        let inner = self
            .indices
            .get(index)
            .ok_or_else(|| anyhow!("Index {} is out of range", index))?;
        self.dataset.get_example(*inner)
    }
}

pub trait Transform<In> {
    type Output;

    fn apply(&self, input: In) -> Result<Self::Output>;
}

/// Applies a transform to every example on access.
pub struct TransformDataset<D, T> {
    dataset: D,
    transform: T,
}

impl<D, T> TransformDataset<D, T> {
    pub fn new(dataset: D, transform: T) -> Self {
        Self { dataset, transform }
    }
}

impl<D: Dataset, T: Transform<D::Item>> Dataset for TransformDataset<D, T> {
    type Item = T::Output;

    fn len(&self) -> usize {
        self.dataset.len()
    }

    fn get_example(&self, index: usize) -> Result<Self::Item> {
        self.transform.apply(self.dataset.get_example(index)?)
    }
}

/// Walks a dataset once, in order, in batches of `batch_size`.
pub struct SerialIter<D> {
    dataset: D,
    batch_size: usize,
    keep_last: bool,
    position: usize,
}

impl<D: Dataset> SerialIter<D> {
    /// With `keep_last` the final batch is yielded even if it is short.
    pub fn new(dataset: D, batch_size: usize, keep_last: bool) -> Result<Self> {
        if batch_size == 0 {
            return Err(anyhow!("Batch size has to be positive"));
        }
        Ok(Self {
            dataset,
            batch_size,
            keep_last,
            position: 0,
        })
    }
}

impl<D: Dataset> Iterator for SerialIter<D> {
    type Item = Result<Vec<D::Item>>;

    fn next(&mut self) -> Option<Self::Item> {
        let remaining = self.dataset.len().saturating_sub(self.position);
        if remaining == 0 || (remaining < self.batch_size && !self.keep_last) {
            return None;
        }
        let end = self.position + remaining.min(self.batch_size);
        let batch = (self.position..end)
            .map(|i| self.dataset.get_example(i))
            .collect::<Result<Vec<D::Item>>>();
        self.position = end;
        Some(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Numbers(usize);

    impl Dataset for Numbers {
        type Item = usize;

        fn len(&self) -> usize {
            self.0
        }

        fn get_example(&self, index: usize) -> Result<usize> {
            if index >= self.0 {
                return Err(anyhow!("out of range"));
            }
            Ok(index)
        }
    }

    struct Square;

    impl Transform<usize> for Square {
        type Output = usize;

        fn apply(&self, input: usize) -> Result<usize> {
            Ok(input * input)
        }
    }

    #[test]
    fn indexing_dataset_test() -> Result<()> {
        let numbers = Numbers(10);
        let subset = IndexingDataset::new(&numbers, vec![7, 2, 9])?;
        assert_eq!(subset.len(), 3);
        assert_eq!(subset.get_example(0)?, 7);
        assert_eq!(subset.get_example(2)?, 9);
        assert!(subset.get_example(3).is_err());
        assert!(IndexingDataset::new(&numbers, vec![1, 10]).is_err());
        Ok(())
    }

    #[test]
    fn transform_dataset_test() -> Result<()> {
        let squares = TransformDataset::new(Numbers(5), Square);
        assert_eq!(squares.len(), 5);
        assert_eq!(squares.get_example(3)?, 9);
        let subset = IndexingDataset::new(&squares, vec![4])?;
        assert_eq!(subset.get_example(0)?, 16);
        Ok(())
    }

    #[test]
    fn serial_iter_batches() -> Result<()> {
        let batches = SerialIter::new(Numbers(5), 2, true)?.collect::<Result<Vec<_>>>()?;
        assert_eq!(batches, vec![vec![0, 1], vec![2, 3], vec![4]]);

        let batches = SerialIter::new(Numbers(5), 2, false)?.collect::<Result<Vec<_>>>()?;
        assert_eq!(batches, vec![vec![0, 1], vec![2, 3]]);

        assert_eq!(SerialIter::new(Numbers(0), 1, true)?.count(), 0);
        assert!(SerialIter::new(Numbers(3), 0, true).is_err());
        Ok(())
    }
}
