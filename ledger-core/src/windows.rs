use crate::models::TokenTransaction;
use serde::Serialize;
use std::time::Duration;

/// Chart lookback windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum LookbackWindow {
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "6h")]
    SixHours,
    #[serde(rename = "12h")]
    TwelveHours,
    #[serde(rename = "18h")]
    EighteenHours,
    #[serde(rename = "1d")]
    OneDay,
    #[serde(rename = "7d")]
    SevenDays,
    #[serde(rename = "14d")]
    FourteenDays,
    #[serde(rename = "30d")]
    ThirtyDays,
    #[serde(rename = "60d")]
    SixtyDays,
}

const HOUR: u64 = 60 * 60;
const DAY: u64 = 24 * HOUR;

impl LookbackWindow {
    pub const ALL: [LookbackWindow; 9] = [
        LookbackWindow::OneHour,
        LookbackWindow::SixHours,
        LookbackWindow::TwelveHours,
        LookbackWindow::EighteenHours,
        LookbackWindow::OneDay,
        LookbackWindow::SevenDays,
        LookbackWindow::FourteenDays,
        LookbackWindow::ThirtyDays,
        LookbackWindow::SixtyDays,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            LookbackWindow::OneHour => "1h",
            LookbackWindow::SixHours => "6h",
            LookbackWindow::TwelveHours => "12h",
            LookbackWindow::EighteenHours => "18h",
            LookbackWindow::OneDay => "1d",
            LookbackWindow::SevenDays => "7d",
            LookbackWindow::FourteenDays => "14d",
            LookbackWindow::ThirtyDays => "30d",
            LookbackWindow::SixtyDays => "60d",
        }
    }

    pub fn duration(&self) -> Duration {
        let secs = match self {
            LookbackWindow::OneHour => HOUR,
            LookbackWindow::SixHours => 6 * HOUR,
            LookbackWindow::TwelveHours => 12 * HOUR,
            LookbackWindow::EighteenHours => 18 * HOUR,
            LookbackWindow::OneDay => DAY,
            LookbackWindow::SevenDays => 7 * DAY,
            LookbackWindow::FourteenDays => 14 * DAY,
            LookbackWindow::ThirtyDays => 30 * DAY,
            LookbackWindow::SixtyDays => 60 * DAY,
        };
        Duration::from_secs(secs)
    }

    /// Block number `duration` ago, assuming a constant block time.
    pub fn target_block(&self, head_block: u64, avg_block_time: Duration) -> u64 {
        let block_secs = avg_block_time.as_secs_f64().max(f64::EPSILON);
        let blocks_back = (self.duration().as_secs_f64() / block_secs).floor() as u64;
        head_block.saturating_sub(blocks_back)
    }
}

/// Where a lookback window starts inside the transaction list.
///
/// `index` is `None` when the window reaches back past the first recorded
/// transaction: there is no data that old yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowIndex {
    pub index: Option<usize>,
    pub block_number: u64,
}

/// First transaction at or after `block_number`.
pub fn first_index_at_or_after(list: &[TokenTransaction], block_number: u64) -> usize {
    list.partition_point(|t| t.block_number < block_number)
}

/// Compute the start of every lookback window for the given chain head.
pub fn compute_windows(
    list: &[TokenTransaction],
    head_block: u64,
    avg_block_time: Duration,
) -> Vec<(LookbackWindow, WindowIndex)> {
    let earliest = list.first().map(|t| t.block_number);

    LookbackWindow::ALL
        .iter()
        .map(|window| {
            let target = window.target_block(head_block, avg_block_time);
            let index = match earliest {
                Some(first) if first <= target => Some(first_index_at_or_after(list, target)),
                _ => None,
            };
            (
                *window,
                WindowIndex {
                    index,
                    block_number: target,
                },
            )
        })
        .collect()
}

/// Memoised window computation, refreshed only when the list length or the
/// chain head moved.
#[derive(Debug, Clone, Default)]
pub struct WindowCache {
    key: Option<(usize, u64)>,
    windows: Vec<(LookbackWindow, WindowIndex)>,
}

impl WindowCache {
    pub fn get(
        &mut self,
        list: &[TokenTransaction],
        head_block: u64,
        avg_block_time: Duration,
    ) -> &[(LookbackWindow, WindowIndex)] {
        let key = (list.len(), head_block);
        if self.key != Some(key) {
            self.windows = compute_windows(list, head_block, avg_block_time);
            self.key = Some(key);
        }
        &self.windows
    }
}
