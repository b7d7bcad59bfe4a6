// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::Mutex;

use chrono::{DateTime, SubsecRound, Utc};
use snapshot_api_types::Time;

/// Source of the timestamps written into object status.
pub trait Clock: Send + Sync {
    fn now(&self) -> Time;
}

/// Wall-clock time, truncated to whole seconds as the API server stores it.
/// Without the truncation a freshly computed status would never compare
/// equal to the one read back from the cache.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Time {
        Time(Utc::now().trunc_subsecs(0))
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct FixedClock(Mutex<DateTime<Utc>>);

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        FixedClock(Mutex::new(now))
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.0.lock().unwrap() = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        *self.0.lock().unwrap() += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> Time {
        Time(*self.0.lock().unwrap())
    }
}
