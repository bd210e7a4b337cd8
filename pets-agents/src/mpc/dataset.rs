use candle_core::{Device, Tensor};
use pets_core::{PetsError, Result, rng};
use rand::rngs::StdRng;

/// Model inputs and targets of every transition seen so far. Lives on the
/// host and only ever grows.
#[derive(Debug, Default)]
pub struct TransitionDataset {
    inputs: Option<Tensor>,
    targets: Option<Tensor>,
}

impl TransitionDataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inputs.as_ref().map_or(0, |inputs| inputs.dims()[0])
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn inputs(&self) -> Result<&Tensor> {
        self.inputs
            .as_ref()
            .ok_or_else(|| PetsError::empty_batch("dataset holds no transitions"))
    }

    pub fn targets(&self) -> Result<&Tensor> {
        self.targets
            .as_ref()
            .ok_or_else(|| PetsError::empty_batch("dataset holds no transitions"))
    }

    /// Appends `(rows, in_features)` inputs and `(rows, out_features)` targets.
    pub fn extend(&mut self, inputs: &Tensor, targets: &Tensor) -> Result<()> {
        let rows = inputs.dim(0)?;
        if targets.dim(0)? != rows {
            return Err(PetsError::ShapeMismatch {
                expected: vec![rows],
                actual: vec![targets.dim(0)?],
            });
        }
        if rows == 0 {
            return Err(PetsError::empty_batch("no transitions to add"));
        }
        let inputs = inputs.to_device(&Device::Cpu)?;
        let targets = targets.to_device(&Device::Cpu)?;
        self.inputs = Some(match self.inputs.take() {
            Some(old) => Tensor::cat(&[&old, &inputs], 0)?,
            None => inputs,
        });
        self.targets = Some(match self.targets.take() {
            Some(old) => Tensor::cat(&[&old, &targets], 0)?,
            None => targets,
        });
        Ok(())
    }

    /// Gathers one row set per member into `(members, rows, features)`
    /// inputs and targets. Every member must select the same number of rows.
    pub fn member_batch(&self, idxs: &[&[u32]]) -> Result<(Tensor, Tensor)> {
        let members = idxs.len();
        let rows = idxs.first().map_or(0, |idx| idx.len());
        if rows == 0 {
            return Err(PetsError::empty_batch("member batch selects no rows"));
        }
        if idxs.iter().any(|idx| idx.len() != rows) {
            return Err(PetsError::invalid_config(
                "every member must select the same number of rows",
            ));
        }
        let flat: Vec<u32> = idxs.iter().flat_map(|idx| idx.iter().copied()).collect();
        let flat = Tensor::from_vec(flat, members * rows, &Device::Cpu)?;
        let gather = |t: &Tensor| -> Result<Tensor> {
            let features = t.dim(1)?;
            Ok(t.index_select(&flat, 0)?.reshape((members, rows, features))?)
        };
        Ok((gather(self.inputs()?)?, gather(self.targets()?)?))
    }
}

/// One independent permutation of `0..len` per ensemble member.
pub fn bootstrap_permutations(rng: &mut StdRng, len: usize, members: usize) -> Vec<Vec<u32>> {
    (0..members).map(|_| rng::randperm(rng, len)).collect()
}

/// Applies the same column permutation to every member's index row.
pub fn permute_columns(idxs: &[Vec<u32>], perm: &[u32]) -> Vec<Vec<u32>> {
    idxs.iter()
        .map(|row| perm.iter().map(|p| row[*p as usize]).collect())
        .collect()
}

/// The `batch`th window of `batch_size` columns, clipped to the row length.
/// Empty when the window starts past the end.
pub fn minibatch(idxs: &[Vec<u32>], batch: usize, batch_size: usize) -> Vec<&[u32]> {
    idxs.iter()
        .map(|row| {
            let start = (batch * batch_size).min(row.len());
            let end = ((batch + 1) * batch_size).min(row.len());
            &row[start..end]
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use candle_core::DType;

    fn dataset(rows: usize) -> Result<TransitionDataset> {
        let xs = Tensor::arange(0f32, rows as f32, &Device::Cpu)?.reshape((rows, 1))?;
        let ys = (&xs * 10.)?;
        let mut dataset = TransitionDataset::new();
        dataset.extend(&xs, &ys)?;
        Ok(dataset)
    }

    #[test]
    fn extend_appends_rows() -> Result<()> {
        let mut dataset = dataset(3)?;
        let more = Tensor::ones((2, 1), DType::F32, &Device::Cpu)?;
        dataset.extend(&more, &more)?;
        assert_eq!(dataset.len(), 5);
        assert_eq!(
            dataset.inputs()?.flatten_all()?.to_vec1::<f32>()?,
            vec![0., 1., 2., 1., 1.]
        );
        Ok(())
    }

    #[test]
    fn extend_rejects_mismatched_rows() -> Result<()> {
        let mut dataset = TransitionDataset::new();
        let xs = Tensor::ones((3, 2), DType::F32, &Device::Cpu)?;
        let ys = Tensor::ones((2, 1), DType::F32, &Device::Cpu)?;
        assert!(dataset.extend(&xs, &ys).is_err());
        assert!(dataset.is_empty());
        assert!(matches!(dataset.inputs(), Err(PetsError::EmptyBatch(_))));
        Ok(())
    }

    #[test]
    fn member_batch_is_member_major() -> Result<()> {
        let dataset = dataset(6)?;
        let (xs, ys) = dataset.member_batch(&[&[0, 1], &[5, 4]])?;
        assert_eq!(xs.dims(), &[2, 2, 1]);
        assert_eq!(
            ys.flatten_all()?.to_vec1::<f32>()?,
            vec![0., 10., 50., 40.]
        );
        assert!(dataset.member_batch(&[&[0, 1], &[5]]).is_err());
        assert!(matches!(
            dataset.member_batch(&[&[], &[]]),
            Err(PetsError::EmptyBatch(_))
        ));
        Ok(())
    }

    #[test]
    fn bootstrap_rows_are_independent_permutations() {
        let mut rng = rng::seeded(0);
        let idxs = bootstrap_permutations(&mut rng, 30, 4);
        assert_eq!(idxs.len(), 4);
        for row in idxs.iter() {
            let mut sorted = row.clone();
            sorted.sort();
            assert_eq!(sorted, (0..30).collect::<Vec<u32>>());
        }
        assert_ne!(idxs[0], idxs[1]);
    }

    #[test]
    fn column_permutation_and_windows() {
        let idxs = vec![vec![10, 11, 12], vec![20, 21, 22]];
        let permuted = permute_columns(&idxs, &[2, 0, 1]);
        assert_eq!(permuted, vec![vec![12, 10, 11], vec![22, 20, 21]]);
        let window = minibatch(&permuted, 1, 2);
        assert_eq!(window, vec![&[11u32][..], &[21u32][..]]);
        assert!(minibatch(&permuted, 2, 2).iter().all(|w| w.is_empty()));
    }
}
