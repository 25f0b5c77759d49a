pub mod access;
pub mod channels;
pub mod day_file;
pub mod power;
pub mod reading;
pub mod resampled;
pub mod site;
pub mod watermark;

pub use access::AccessRecord;
pub use channels::{ChannelValues, ACTIVE_POWER, CHANNEL_COUNT, CHANNEL_NAMES};
pub use day_file::{DayFileKey, DayFileNameError};
pub use power::PowerRecord;
pub use reading::Reading;
pub use resampled::{DaySeries, ResampledRow};
pub use site::{site_day, start_of_day, SiteId, SourceKind};
pub use watermark::Watermark;
