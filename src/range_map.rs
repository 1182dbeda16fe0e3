// Interval-indexed mapping of guest address ranges to payloads
//
// Austin Shafer - 2024

use crate::range::AddressRange;

use std::collections::BTreeMap;

/// One mapped area. The begin address is the key in the tree.
#[derive(Clone)]
struct Area<P> {
    a_end: u64,
    a_payload: P,
}

/// An ordered map from disjoint half-open address ranges to payloads.
///
/// This is the backbone of every cache table: one `RangeMap` per entry
/// kind, plus the sync table. The container keeps ranges disjoint at
/// all times, splitting and trimming colliding areas as new ranges are
/// mapped in.
///
/// `map` has two modes, matching the two ways the cache uses it:
///
///   * `split_on_collision`: carve the requested range out of any
///     overlap, preserving the payloads of the pieces. If one existing
///     area already covers the whole range, the carved middle keeps
///     that area's payload, making this a get-or-insert.
///   * otherwise: the requested range takes the new payload, and
///     whatever it overlapped is trimmed back to the edges. This is a
///     plain replace.
pub struct RangeMap<P> {
    rm_areas: BTreeMap<u64, Area<P>>,
}

impl<P> Default for RangeMap<P> {
    fn default() -> Self {
        Self {
            rm_areas: BTreeMap::new(),
        }
    }
}

impl<P: Clone + PartialEq> RangeMap<P> {
    pub fn new() -> Self {
        Self {
            rm_areas: BTreeMap::new(),
        }
    }

    pub fn clear(&mut self) {
        self.rm_areas.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.rm_areas.is_empty()
    }

    /// Remove every area overlapping `range` from the tree and return
    /// them, oldest address first.
    fn take_overlaps(&mut self, range: AddressRange) -> Vec<(u64, Area<P>)> {
        let mut keys = Vec::new();

        // An area starting before the range may still reach into it
        if let Some((&begin, area)) = self.rm_areas.range(..=range.begin()).next_back() {
            if area.a_end > range.begin() {
                keys.push(begin);
            }
        }

        let leftmost = keys.first().copied();
        keys.extend(
            self.rm_areas
                .range(range.begin()..range.end())
                .map(|(&b, _)| b)
                .filter(|&b| Some(b) != leftmost),
        );

        keys.sort_unstable();

        keys.into_iter()
            .map(|k| (k, self.rm_areas.remove(&k).unwrap()))
            .collect()
    }

    /// Insert `[range.begin, range.end)` into the map. Returns a
    /// reference to the payload now occupying exactly that range.
    pub fn map(
        &mut self,
        range: AddressRange,
        payload: P,
        merge_adjacent: bool,
        split_on_collision: bool,
    ) -> &mut P {
        assert!(range.is_valid());

        let overlaps = self.take_overlaps(range);

        // The payload that ends up on the requested range: with
        // splitting enabled an old area covering the whole range wins,
        // otherwise the caller's payload does.
        let mut chosen = payload;

        for (begin, area) in overlaps {
            let covers = begin <= range.begin() && area.a_end >= range.end();

            if begin < range.begin() {
                self.rm_areas.insert(
                    begin,
                    Area {
                        a_end: range.begin(),
                        a_payload: area.a_payload.clone(),
                    },
                );
            }
            if area.a_end > range.end() {
                self.rm_areas.insert(
                    range.end(),
                    Area {
                        a_end: area.a_end,
                        a_payload: area.a_payload.clone(),
                    },
                );
            }

            if split_on_collision && covers {
                chosen = area.a_payload;
            }
        }

        let mut key = range.begin();
        let mut end = range.end();

        if merge_adjacent {
            // Coalesce with an equal-payload neighbor on either side
            if let Some((&lbegin, larea)) = self.rm_areas.range(..key).next_back() {
                if larea.a_end == key && larea.a_payload == chosen {
                    self.rm_areas.remove(&lbegin);
                    key = lbegin;
                }
            }
            if let Some(rarea) = self.rm_areas.get(&end) {
                if rarea.a_payload == chosen {
                    end = rarea.a_end;
                    self.rm_areas.remove(&range.end());
                }
            }
        }

        self.rm_areas.insert(
            key,
            Area {
                a_end: end,
                a_payload: chosen,
            },
        );

        &mut self.rm_areas.get_mut(&key).unwrap().a_payload
    }

    /// Erase any overlap with `range`, splitting areas that stick out
    /// past its edges. Payloads of areas erased in full are returned
    /// so the caller can run per-entry invalidation.
    pub fn unmap(&mut self, range: AddressRange) -> Vec<P> {
        let overlaps = self.take_overlaps(range);
        let mut erased = Vec::new();

        for (begin, area) in overlaps {
            let mut partial = false;

            if begin < range.begin() {
                self.rm_areas.insert(
                    begin,
                    Area {
                        a_end: range.begin(),
                        a_payload: area.a_payload.clone(),
                    },
                );
                partial = true;
            }
            if area.a_end > range.end() {
                self.rm_areas.insert(
                    range.end(),
                    Area {
                        a_end: area.a_end,
                        a_payload: area.a_payload.clone(),
                    },
                );
                partial = true;
            }

            if !partial {
                erased.push(area.a_payload);
            }
        }

        erased
    }

    /// The single area containing `address`, if any.
    pub fn query_area(&self, address: u64) -> Option<(AddressRange, &P)> {
        let (&begin, area) = self.rm_areas.range(..=address).next_back()?;
        if area.a_end <= address {
            return None;
        }
        Some((AddressRange::from_begin_end(begin, area.a_end), &area.a_payload))
    }

    pub fn query_area_mut(&mut self, address: u64) -> Option<(AddressRange, &mut P)> {
        let (&begin, area) = self.rm_areas.range_mut(..=address).next_back()?;
        if area.a_end <= address {
            return None;
        }
        Some((
            AddressRange::from_begin_end(begin, area.a_end),
            &mut area.a_payload,
        ))
    }

    /// Iterate areas in address order starting from the area that
    /// contains `address`, or the first area after it. This is the
    /// entry point for every overlap walk.
    pub fn lower_bound(&self, address: u64) -> impl Iterator<Item = (AddressRange, &P)> {
        let start = match self.rm_areas.range(..=address).next_back() {
            Some((&begin, area)) if area.a_end > address => begin,
            _ => address,
        };

        self.rm_areas
            .range(start..)
            .map(|(&b, a)| (AddressRange::from_begin_end(b, a.a_end), &a.a_payload))
    }

    pub fn iter(&self) -> impl Iterator<Item = (AddressRange, &P)> {
        self.rm_areas
            .iter()
            .map(|(&b, a)| (AddressRange::from_begin_end(b, a.a_end), &a.a_payload))
    }
}
