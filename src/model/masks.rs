//! Semantic masks derived from the parsing and DensePose maps of a batch.
//!
//! Every mask is a `{0, 1}` float tensor of shape `[batch, 1, H, W]`. Unions of
//! disjoint codes are sums and intersections are products.

use burn::prelude::*;

use crate::model::constants::{DENSEPOSE_CLASSES, densepose, label};
use crate::model::data::TryOnBatch;

/// `1` where `map` holds any of `codes`.
pub fn code_mask<B: Backend>(map: &Tensor<B, 4>, codes: &[u32]) -> Tensor<B, 4> {
    codes
        .iter()
        .map(|&code| map.clone().equal_elem(code as f32).float())
        .reduce(|acc, mask| acc + mask)
        .unwrap_or_else(|| map.zeros_like())
}

/// `1` where `tensor > threshold`.
pub fn binarize<B: Backend>(tensor: Tensor<B, 4>, threshold: f32) -> Tensor<B, 4> {
    tensor.greater_elem(threshold).float()
}

/// Scatters each categorical code into its own channel.
pub fn one_hot_channels<B: Backend>(codes: &Tensor<B, 4>, classes: usize) -> Tensor<B, 4> {
    let [batch, _, height, width] = codes.dims();
    let device = codes.device();
    Tensor::<B, 4>::zeros([batch, classes, height, width], &device).scatter(
        1,
        codes.clone().int(),
        Tensor::ones([batch, 1, height, width], &device),
    )
}

#[derive(Debug, Clone)]
pub struct SemanticMasks<B: Backend> {
    /// Parsing map with the clothes alias folded into the clothes code.
    pub label: Tensor<B, 4>,
    pub pre_clothes_edge: Tensor<B, 4>,
    pub clothes: Tensor<B, 4>,
    pub person_clothes_edge: Tensor<B, 4>,
    pub person_clothes: Tensor<B, 4>,
    pub densepose_onehot: Tensor<B, 4>,
    pub densepose_fore: Tensor<B, 4>,
    pub face_mask: Tensor<B, 4>,
    pub other_clothes_mask: Tensor<B, 4>,
    pub arm_mask: Tensor<B, 4>,
    pub hand_mask: Tensor<B, 4>,
    pub dense_preserve_mask: Tensor<B, 4>,
    /// `[face_mask, other_clothes_mask]` along channels.
    pub preserve_mask: Tensor<B, 4>,
    /// Face, other clothes and hands copied from the person image.
    pub preserve_region: Tensor<B, 4>,
    /// Warp conditioning: preserve mask, densepose one-hot and pose.
    pub concat: Tensor<B, 4>,
}

impl<B: Backend> SemanticMasks<B> {
    pub fn build(batch: &TryOnBatch<B>) -> Self {
        let alias = batch.label.clone().equal_elem(label::CLOTHES_ALIAS as f32).float();
        let label_map = batch.label.clone() * (alias.ones_like() - alias.clone())
            + alias * label::CLOTHES as f32;

        let pre_clothes_edge = binarize(batch.edge.clone(), 0.5);
        let clothes = batch.color.clone() * pre_clothes_edge.clone();

        let person_clothes_edge = code_mask(&label_map, &[label::CLOTHES]);
        let real_image = batch.image.clone();
        let person_clothes = real_image.clone() * person_clothes_edge.clone();

        let densepose_onehot = one_hot_channels(&batch.densepose, DENSEPOSE_CLASSES);
        let densepose_fore = batch.densepose.clone().div_scalar(densepose::MAX_CODE);

        let face_mask = code_mask(&label_map, &label::FACE);
        let other_clothes_mask = code_mask(&label_map, &label::OTHER_CLOTHES);
        let arm_mask = code_mask(&label_map, &label::ARMS);
        let hand_mask = arm_mask.clone() * code_mask(&batch.densepose, &densepose::HANDS);

        let dense_preserve_mask = code_mask(&batch.densepose, &densepose::PRESERVE)
            * (person_clothes_edge.ones_like() - person_clothes_edge.clone());

        let face_img = face_mask.clone() * real_image.clone();
        let other_clothes_img = other_clothes_mask.clone() * real_image.clone();
        let hand_img = hand_mask.clone() * real_image;
        let preserve_region = face_img + other_clothes_img + hand_img;

        let preserve_mask = Tensor::cat(vec![face_mask.clone(), other_clothes_mask.clone()], 1);
        let concat = Tensor::cat(
            vec![
                preserve_mask.clone(),
                densepose_onehot.clone(),
                batch.pose.clone(),
            ],
            1,
        );

        Self {
            label: label_map,
            pre_clothes_edge,
            clothes,
            person_clothes_edge,
            person_clothes,
            densepose_onehot,
            densepose_fore,
            face_mask,
            other_clothes_mask,
            arm_mask,
            hand_mask,
            dense_preserve_mask,
            preserve_mask,
            preserve_region,
            concat,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::constants::{CHANNELS, POSE_CHANNELS, WARP_CONDITION_CHANNELS};
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    pub(crate) fn batch_from_maps<B: Backend>(
        labels: &[f32],
        densepose_codes: &[f32],
        height: usize,
        width: usize,
        device: &B::Device,
    ) -> TryOnBatch<B> {
        let plane = |values: &[f32]| {
            Tensor::<B, 4>::from_data(
                TensorData::new(values.to_vec(), [1, 1, height, width]),
                device,
            )
        };
        TryOnBatch {
            label: plane(labels),
            edge: Tensor::full([1, 1, height, width], 0.8, device),
            color: Tensor::full([1, CHANNELS, height, width], 0.25, device),
            image: Tensor::full([1, CHANNELS, height, width], 0.5, device),
            pose: Tensor::zeros([1, POSE_CHANNELS, height, width], device),
            densepose: plane(densepose_codes),
        }
    }

    fn values(tensor: Tensor<TestBackend, 4>) -> Vec<f32> {
        tensor.into_data().to_vec::<f32>().unwrap()
    }

    #[test]
    fn clothes_alias_is_folded_into_clothes() {
        let device = Default::default();
        let batch = batch_from_maps::<TestBackend>(&[7.0, 4.0, 3.0, 0.0], &[0.0; 4], 2, 2, &device);
        let masks = SemanticMasks::build(&batch);

        assert_eq!(values(masks.label), vec![4.0, 4.0, 3.0, 0.0]);
        assert_eq!(values(masks.person_clothes_edge), vec![1.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn label_partitions_are_disjoint_and_match_code_sets() {
        let device = Default::default();
        let labels: Vec<f32> = (0..16).map(|v| v as f32).collect();
        let batch = batch_from_maps::<TestBackend>(&labels, &[0.0; 16], 4, 4, &device);
        let masks = SemanticMasks::build(&batch);

        let clothes = values(masks.person_clothes_edge);
        let face = values(masks.face_mask);
        let other = values(masks.other_clothes_mask);
        let arms = values(masks.arm_mask);

        for (i, &code) in labels.iter().enumerate() {
            let code = code as u32;
            let expected_clothes = code == 4 || code == 7;
            let expected_face = label::FACE.contains(&code);
            let expected_other = label::OTHER_CLOTHES.contains(&code);
            let expected_arms = label::ARMS.contains(&code);
            assert_eq!(clothes[i] == 1.0, expected_clothes, "clothes at code {code}");
            assert_eq!(face[i] == 1.0, expected_face, "face at code {code}");
            assert_eq!(other[i] == 1.0, expected_other, "other at code {code}");
            assert_eq!(arms[i] == 1.0, expected_arms, "arms at code {code}");
            assert!(clothes[i] + face[i] + other[i] + arms[i] <= 1.0);
        }
    }

    #[test]
    fn densepose_one_hot_sums_to_one() {
        let device = Default::default();
        let codes: Vec<f32> = (0..25).map(|v| v as f32).collect();
        let map = Tensor::<TestBackend, 4>::from_data(TensorData::new(codes, [1, 1, 5, 5]), &device);
        let onehot = one_hot_channels(&map, DENSEPOSE_CLASSES);

        assert_eq!(onehot.dims(), [1, DENSEPOSE_CLASSES, 5, 5]);
        let sums = values(onehot.clone().sum_dim(1));
        assert!(sums.iter().all(|&s| s == 1.0));

        let hot = values(onehot.slice([0..1, 7..8, 0..5, 0..5]));
        let on: Vec<usize> = hot
            .iter()
            .enumerate()
            .filter(|(_, v)| **v == 1.0)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(on, vec![7]);
    }

    #[test]
    fn thresholding_binary_edge_is_idempotent() {
        let device = Default::default();
        let edge = Tensor::<TestBackend, 4>::from_data(
            TensorData::new(vec![0.1, 0.6, 0.5, 0.9], [1, 1, 2, 2]),
            &device,
        );
        let once = binarize(edge, 0.5);
        let twice = binarize(once.clone(), 0.5);
        assert_eq!(values(once.clone()), vec![0.0, 1.0, 0.0, 1.0]);
        assert_eq!(values(once), values(twice));
    }

    #[test]
    fn hands_need_both_arm_label_and_hand_densepose() {
        let device = Default::default();
        let batch = batch_from_maps::<TestBackend>(
            &[11.0, 13.0, 11.0, 2.0],
            &[3.0, 4.0, 10.0, 3.0],
            2,
            2,
            &device,
        );
        let masks = SemanticMasks::build(&batch);
        assert_eq!(values(masks.hand_mask), vec![1.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn dense_preserve_excludes_clothes_area() {
        let device = Default::default();
        let batch = batch_from_maps::<TestBackend>(
            &[4.0, 0.0, 0.0, 0.0],
            &[15.0, 22.0, 23.0, 14.0],
            2,
            2,
            &device,
        );
        let masks = SemanticMasks::build(&batch);
        assert_eq!(values(masks.dense_preserve_mask), vec![0.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn clothes_only_batch_preserves_nothing() {
        let device = Default::default();
        let batch = batch_from_maps::<TestBackend>(&[4.0; 12], &[15.0; 12], 3, 4, &device);
        let masks = SemanticMasks::build(&batch);

        assert!(values(masks.dense_preserve_mask).iter().all(|&v| v == 0.0));
        assert!(values(masks.face_mask).iter().all(|&v| v == 0.0));
        assert!(values(masks.other_clothes_mask).iter().all(|&v| v == 0.0));
        assert!(values(masks.hand_mask).iter().all(|&v| v == 0.0));
        assert!(values(masks.preserve_region).iter().all(|&v| v == 0.0));
        assert!(values(masks.person_clothes_edge).iter().all(|&v| v == 1.0));
    }

    #[test]
    fn preserve_region_copies_face_other_clothes_and_hands() {
        let device = Default::default();
        let batch = batch_from_maps::<TestBackend>(
            &[1.0, 5.0, 11.0, 4.0],
            &[0.0, 0.0, 3.0, 0.0],
            2,
            2,
            &device,
        );
        let masks = SemanticMasks::build(&batch);
        let region = values(masks.preserve_region.slice([0..1, 0..1, 0..2, 0..2]));
        assert_eq!(region, vec![0.5, 0.5, 0.5, 0.0]);
    }

    #[test]
    fn conditioning_and_clothes_shapes() {
        let device = Default::default();
        let batch = batch_from_maps::<TestBackend>(&[0.0; 4], &[0.0; 4], 2, 2, &device);
        let masks = SemanticMasks::build(&batch);

        assert_eq!(masks.concat.dims(), [1, WARP_CONDITION_CHANNELS, 2, 2]);
        assert_eq!(masks.preserve_mask.dims(), [1, 2, 2, 2]);
        // edge 0.8 > 0.5 so the cloth passes through unchanged
        assert!(values(masks.clothes).iter().all(|&v| v == 0.25));
        assert!(values(masks.densepose_fore).iter().all(|&v| v == 0.0));
    }
}
