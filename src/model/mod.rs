pub mod architecture;
pub mod composition;
pub mod data;
pub mod diagnostics;
pub mod flow;
pub mod loss;
pub mod masks;
pub mod objective;
pub mod session;
pub mod step;
pub mod training;
pub mod vgg;
pub mod warp;
pub mod warp_net;

pub mod constants {
    pub const HEIGHT: usize = 256;
    pub const WIDTH: usize = 192;
    pub const CHANNELS: usize = 3;

    /// Number of DensePose part indices, background included.
    pub const DENSEPOSE_CLASSES: usize = 25;
    pub const POSE_CHANNELS: usize = 18;
    /// preserve mask (2) + densepose one-hot (25) + pose (18)
    pub const WARP_CONDITION_CHANNELS: usize = 2 + DENSEPOSE_CLASSES + POSE_CHANNELS;
    /// preserve region (3) + warped cloth (3) + warped edge (1) + dense preserve (1)
    pub const GENERATOR_INPUT_CHANNELS: usize = 8;
    pub const GENERATOR_OUTPUT_CHANNELS: usize = 4;

    /// Flow pyramid depth. Stage `n` runs at scale `0.5^(NUM_SCALES - 1 - n)`.
    pub const NUM_SCALES: usize = 5;

    pub mod label {
        pub const FACE: [u32; 2] = [1, 12];
        pub const CLOTHES: u32 = 4;
        /// Parsed as a separate class but trained as clothes.
        pub const CLOTHES_ALIAS: u32 = 7;
        pub const OTHER_CLOTHES: [u32; 5] = [5, 6, 8, 9, 10];
        pub const ARMS: [u32; 2] = [11, 13];
    }

    pub mod densepose {
        pub const HANDS: [u32; 2] = [3, 4];
        pub const PRESERVE: [u32; 8] = [15, 16, 17, 18, 19, 20, 21, 22];
        /// Largest part index, used to map codes into [0, 1] for display.
        pub const MAX_CODE: f32 = 24.0;
    }
}
