//! Bounded slab arena with generation-checked handles.
//!
//! The deallocation ledger hands out a stable cookie per registered
//! record so callers can unregister out of order. Slots are recycled
//! through a free list; each recycle bumps the slot generation so a
//! stale cookie can never reach a live record.

use rfs_error::{Result, WalError};

/// Handle to a live arena slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cookie {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
enum Slot<T> {
    Free { next: Option<u32>, generation: u32 },
    Live { value: T, generation: u32 },
}

/// Fixed-capacity slab. `insert` fails with `LedgerFull` at the limit
/// rather than growing past it.
#[derive(Debug)]
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<u32>,
    limit: usize,
    live: usize,
    high_water: usize,
}

impl<T> Arena<T> {
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            limit,
            live: 0,
            high_water: 0,
        }
    }

    /// Number of live records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.live
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Capacity ceiling this arena enforces.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Most records ever live at once.
    #[must_use]
    pub fn high_water(&self) -> usize {
        self.high_water
    }

    pub fn insert(&mut self, value: T) -> Result<Cookie> {
        if self.live >= self.limit {
            return Err(WalError::LedgerFull {
                count: self.live,
                limit: self.limit,
            });
        }
        self.insert_unchecked(value)
    }

    /// Insert past the capacity limit. Callers that cannot tolerate a
    /// `LedgerFull` failure (an operation already half-applied) use this
    /// and rely on the next flush to drain the excess.
    pub fn insert_forced(&mut self, value: T) -> Result<Cookie> {
        self.insert_unchecked(value)
    }

    fn insert_unchecked(&mut self, value: T) -> Result<Cookie> {
        let cookie = if let Some(index) = self.free_head {
            let slot = &mut self.slots[index as usize];
            let Slot::Free { next, generation } = *slot else {
                unreachable!("free list points at a live slot");
            };
            self.free_head = next;
            let generation = generation.wrapping_add(1);
            *slot = Slot::Live { value, generation };
            Cookie { index, generation }
        } else {
            let index = u32::try_from(self.slots.len()).map_err(|_| WalError::LedgerFull {
                count: self.live,
                limit: self.limit,
            })?;
            self.slots.push(Slot::Live {
                value,
                generation: 0,
            });
            Cookie {
                index,
                generation: 0,
            }
        };
        self.live += 1;
        self.high_water = self.high_water.max(self.live);
        Ok(cookie)
    }

    /// Fetch the record behind `cookie`, if it is still live.
    #[must_use]
    pub fn get(&self, cookie: Cookie) -> Option<&T> {
        match self.slots.get(cookie.index as usize) {
            Some(Slot::Live { value, generation }) if *generation == cookie.generation => {
                Some(value)
            }
            _ => None,
        }
    }

    /// Remove and return the record behind `cookie`. Stale cookies
    /// return `None`.
    pub fn remove(&mut self, cookie: Cookie) -> Option<T> {
        let slot = self.slots.get_mut(cookie.index as usize)?;
        match slot {
            Slot::Live { generation, .. } if *generation == cookie.generation => {
                let generation = *generation;
                let old = std::mem::replace(
                    slot,
                    Slot::Free {
                        next: self.free_head,
                        generation,
                    },
                );
                self.free_head = Some(cookie.index);
                self.live -= 1;
                let Slot::Live { value, .. } = old else {
                    unreachable!();
                };
                Some(value)
            }
            _ => None,
        }
    }

    /// Visit live records in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (Cookie, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Live { value, generation } => Some((
                    Cookie {
                        index: index as u32,
                        generation: *generation,
                    },
                    value,
                )),
                Slot::Free { .. } => None,
            })
    }

    /// Remove every live record, visiting each as it goes.
    pub fn drain_with(&mut self, mut f: impl FnMut(T)) {
        for index in 0..self.slots.len() {
            let slot = &mut self.slots[index];
            if let Slot::Live { generation, .. } = slot {
                let generation = *generation;
                let old = std::mem::replace(
                    slot,
                    Slot::Free {
                        next: self.free_head,
                        generation,
                    },
                );
                self.free_head = Some(index as u32);
                self.live -= 1;
                if let Slot::Live { value, .. } = old {
                    f(value);
                }
            }
        }
        debug_assert_eq!(self.live, 0);
    }
}
