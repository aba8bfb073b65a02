//! Core value types: device specs, resource tags, resource vectors, tickets

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Kind of compute device
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    /// Host CPU
    Cpu,
    /// CUDA-class GPU
    Gpu,
}

impl DeviceKind {
    /// Short lowercase name
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            DeviceKind::Cpu => "cpu",
            DeviceKind::Gpu => "gpu",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A concrete device: kind plus ordinal
///
/// Value-typed, hashable and totally ordered so it can key accounting
/// tables and sort deterministically in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceSpec {
    /// Device kind
    pub kind: DeviceKind,
    /// Device ordinal within the kind
    pub index: u32,
}

impl DeviceSpec {
    /// Create a device spec
    #[inline]
    #[must_use]
    pub const fn new(kind: DeviceKind, index: u32) -> Self {
        Self { kind, index }
    }

    /// CPU device shorthand
    #[inline]
    #[must_use]
    pub const fn cpu(index: u32) -> Self {
        Self::new(DeviceKind::Cpu, index)
    }

    /// GPU device shorthand
    #[inline]
    #[must_use]
    pub const fn gpu(index: u32) -> Self {
        Self::new(DeviceKind::Gpu, index)
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.index)
    }
}

/// Typed resource class
///
/// Closed per build; adding a variant is a source-level change that all
/// accounting tables pick up automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ResourceType {
    /// Device memory in bytes
    Memory,
    /// Physical GPU stream slots
    GpuStream,
    /// CPU compute time share
    CpuComputeTime,
    /// GPU compute time share
    GpuComputeTime,
}

impl ResourceType {
    /// Short lowercase name
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            ResourceType::Memory => "memory",
            ResourceType::GpuStream => "gpu_stream",
            ResourceType::CpuComputeTime => "cpu_time",
            ResourceType::GpuComputeTime => "gpu_time",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A resource class bound to a concrete device
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceTag {
    /// Resource class
    pub ty: ResourceType,
    /// Device the resource lives on
    pub spec: DeviceSpec,
}

impl ResourceTag {
    /// Create a tag
    #[inline]
    #[must_use]
    pub const fn new(ty: ResourceType, spec: DeviceSpec) -> Self {
        Self { ty, spec }
    }
}

impl fmt::Display for ResourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.ty, self.spec)
    }
}

/// A vector of resource amounts keyed by tag
///
/// Zero entries are equivalent to absent entries; mutating operations
/// normalize by dropping tags that reach zero. Iteration order is the
/// tag order, which keeps admission checks and log lines deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resources(BTreeMap<ResourceTag, u64>);

impl Serialize for Resources {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.iter().collect::<Vec<_>>().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Resources {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let entries = Vec::<(ResourceTag, u64)>::deserialize(deserializer)?;
        Ok(Self(entries.into_iter().collect()))
    }
}

impl Resources {
    /// Empty resource vector
    #[must_use]
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Single-entry vector
    #[must_use]
    pub fn single(tag: ResourceTag, amount: u64) -> Self {
        let mut res = Self::new();
        res.set(tag, amount);
        res
    }

    /// Amount recorded for a tag, zero when absent
    #[inline]
    #[must_use]
    pub fn get(&self, tag: ResourceTag) -> u64 {
        self.0.get(&tag).copied().unwrap_or(0)
    }

    /// Set the amount for a tag; zero removes the entry
    pub fn set(&mut self, tag: ResourceTag, amount: u64) {
        if amount == 0 {
            self.0.remove(&tag);
        } else {
            self.0.insert(tag, amount);
        }
    }

    /// Add to the amount for a tag
    pub fn add(&mut self, tag: ResourceTag, amount: u64) {
        if amount == 0 {
            return;
        }
        *self.0.entry(tag).or_insert(0) += amount;
    }

    /// Subtract from the amount for a tag, saturating at zero
    pub fn sub_saturating(&mut self, tag: ResourceTag, amount: u64) {
        let current = self.get(tag);
        self.set(tag, current.saturating_sub(amount));
    }

    /// Merge another vector into this one, summing per tag
    pub fn merge(&mut self, other: &Resources) {
        for (tag, amount) in other.iter() {
            self.add(tag, amount);
        }
    }

    /// True when every entry of `other` fits under this vector
    #[must_use]
    pub fn contains(&self, other: &Resources) -> bool {
        other.iter().all(|(tag, amount)| self.get(tag) >= amount)
    }

    /// Number of nonzero entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no nonzero entries remain
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate entries in tag order
    pub fn iter(&self) -> impl Iterator<Item = (ResourceTag, u64)> + '_ {
        self.0.iter().map(|(tag, amount)| (*tag, *amount))
    }

    /// Tags present in this vector
    pub fn tags(&self) -> impl Iterator<Item = ResourceTag> + '_ {
        self.0.keys().copied()
    }
}

impl FromIterator<(ResourceTag, u64)> for Resources {
    fn from_iter<I: IntoIterator<Item = (ResourceTag, u64)>>(iter: I) -> Self {
        let mut res = Self::new();
        for (tag, amount) in iter {
            res.add(tag, amount);
        }
        res
    }
}

impl fmt::Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (tag, amount)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", tag, amount)?;
        }
        write!(f, "}}")
    }
}

/// Opaque reservation identifier minted by the resource monitor
///
/// Tickets are monotonically increasing and nonzero; zero is reserved
/// as the invalid sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ticket(pub u64);

impl Ticket {
    /// The invalid ticket
    pub const INVALID: Ticket = Ticket(0);

    /// Create from a raw value
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw value
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// True for any ticket other than the zero sentinel
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "ticket#{}", self.0)
        } else {
            f.write_str("ticket#invalid")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_gpu0() -> ResourceTag {
        ResourceTag::new(ResourceType::Memory, DeviceSpec::gpu(0))
    }

    #[test]
    fn test_device_spec_display() {
        assert_eq!(DeviceSpec::gpu(0).to_string(), "gpu:0");
        assert_eq!(DeviceSpec::cpu(2).to_string(), "cpu:2");
    }

    #[test]
    fn test_device_spec_ordering() {
        let mut specs = vec![DeviceSpec::gpu(1), DeviceSpec::cpu(0), DeviceSpec::gpu(0)];
        specs.sort();
        assert_eq!(
            specs,
            vec![DeviceSpec::cpu(0), DeviceSpec::gpu(0), DeviceSpec::gpu(1)]
        );
    }

    #[test]
    fn test_tag_display() {
        assert_eq!(mem_gpu0().to_string(), "memory@gpu:0");
    }

    #[test]
    fn test_resources_zero_normalization() {
        let mut res = Resources::new();
        res.set(mem_gpu0(), 10);
        assert_eq!(res.len(), 1);

        res.set(mem_gpu0(), 0);
        assert!(res.is_empty());
        assert_eq!(res.get(mem_gpu0()), 0);
    }

    #[test]
    fn test_resources_add_sub() {
        let mut res = Resources::new();
        res.add(mem_gpu0(), 5);
        res.add(mem_gpu0(), 7);
        assert_eq!(res.get(mem_gpu0()), 12);

        res.sub_saturating(mem_gpu0(), 20);
        assert!(res.is_empty());
    }

    #[test]
    fn test_resources_merge_contains() {
        let stream = ResourceTag::new(ResourceType::GpuStream, DeviceSpec::gpu(0));
        let mut a = Resources::single(mem_gpu0(), 10);
        let b = Resources::single(stream, 2);

        a.merge(&b);
        assert_eq!(a.get(stream), 2);
        assert!(a.contains(&b));
        assert!(!b.contains(&a));
    }

    #[test]
    fn test_resources_display() {
        let mut res = Resources::single(mem_gpu0(), 40);
        res.add(ResourceTag::new(ResourceType::GpuStream, DeviceSpec::gpu(0)), 2);
        let s = res.to_string();
        assert!(s.contains("memory@gpu:0=40"));
        assert!(s.contains("gpu_stream@gpu:0=2"));
    }

    #[test]
    fn test_ticket_validity() {
        assert!(!Ticket::INVALID.is_valid());
        assert!(Ticket::from_raw(1).is_valid());
        assert_eq!(Ticket::from_raw(7).to_string(), "ticket#7");
        assert_eq!(Ticket::INVALID.to_string(), "ticket#invalid");
    }

    #[test]
    fn test_resources_serde_round_trip() {
        let res = Resources::single(mem_gpu0(), 40);
        let encoded = serde_json::to_string(&res).unwrap();
        let decoded: Resources = serde_json::from_str(&encoded).unwrap();
        assert_eq!(res, decoded);
    }
}
