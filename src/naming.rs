//! Acquisition naming and gain rules.

use crate::config::ChannelGain;

/// Coordinates encoded in the final image name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImageCoords {
    /// Well column.
    pub well_x: u32,
    /// Well row.
    pub well_y: u32,
    /// Acquisition job id.
    pub job_id: u32,
    /// Field column.
    pub field_x: u32,
    /// Field row.
    pub field_y: u32,
    /// Z index.
    pub z_slice: u32,
    /// Channel index as written into the name.
    pub channel: u32,
}

/// `U{well_x}--V{well_y}--E{job}--X{field_x}--Y{field_y}--Z{z}--C{channel}.ome.tif`, two
/// digits each.
pub fn image_name(coords: &ImageCoords) -> String {
    format!(
        "U{:02}--V{:02}--E{:02}--X{:02}--Y{:02}--Z{:02}--C{:02}.ome.tif",
        coords.well_x,
        coords.well_y,
        coords.job_id,
        coords.field_x,
        coords.field_y,
        coords.z_slice,
        coords.channel
    )
}

/// Channel index of an experiment image.
///
/// The first and last experiment jobs image one channel each, the middle job images two.
/// Returns `None` for images outside the experiment jobs.
pub fn exp_channel_index(job_id: u32, channel_id: u32, exp_job_ids: &[u32; 3]) -> Option<u32> {
    if channel_id > 1 {
        return None;
    }
    if job_id == exp_job_ids[0] {
        Some(0)
    } else if job_id == exp_job_ids[1] {
        Some(1 + channel_id)
    } else if job_id == exp_job_ids[2] {
        Some(3)
    } else {
        None
    }
}

/// Gain to apply: the reported gain, or the channel default, capped at `max_gain`.
pub fn clamp_gain(reported: Option<u32>, policy: &ChannelGain) -> Option<u32> {
    reported
        .or(policy.default_gain)
        .map(|gain| gain.min(policy.max_gain))
}

/// The most centered field of a well, where gain is estimated.
pub fn gain_field_coords(x_fields: u32, y_fields: u32) -> (u32, u32) {
    (x_fields.div_ceil(2), y_fields.div_ceil(2).saturating_sub(1))
}
