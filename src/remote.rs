// Guest memory window
//
// Austin Shafer - 2024

use crate::range::AddressRange;

use std::slice;

/// A host-addressable window onto one guest VM's memory.
///
/// The process that embeds the cache maps the guest address space
/// somewhere and hands us the base. Guest virtual addresses are plain
/// offsets from it.
#[derive(Copy, Clone, Debug)]
pub struct RemoteMemory {
    rm_vm_id: u32,
    rm_base: *mut u8,
    rm_size: u64,
}

// WARNING
// While it is safe according to the language, sending this between
// threads is only sound because the embedder keeps the mapping alive
// for the lifetime of the cache and all synchronization of the bytes
// themselves goes through the acquisition protocol.
unsafe impl Send for RemoteMemory {}
unsafe impl Sync for RemoteMemory {}

impl RemoteMemory {
    pub fn new(vm_id: u32, base: *mut u8, size: u64) -> Self {
        Self {
            rm_vm_id: vm_id,
            rm_base: base,
            rm_size: size,
        }
    }

    pub fn vm_id(&self) -> u32 {
        self.rm_vm_id
    }

    fn check(&self, range: AddressRange) {
        assert!(
            range.end() <= self.rm_size,
            "guest address range {:?} outside the mapped window",
            range
        );
    }

    /// Host slice for a guest range. Aliasing of these slices is
    /// governed entirely by cache entry acquisition.
    pub fn slice(&self, range: AddressRange) -> &[u8] {
        self.check(range);
        unsafe { slice::from_raw_parts(self.rm_base.add(range.begin() as usize), range.size() as usize) }
    }

    #[allow(clippy::mut_from_ref)]
    pub fn slice_mut(&self, range: AddressRange) -> &mut [u8] {
        self.check(range);
        unsafe {
            slice::from_raw_parts_mut(self.rm_base.add(range.begin() as usize), range.size() as usize)
        }
    }

    pub fn read(&self, range: AddressRange, target: &mut [u8]) {
        target.copy_from_slice(self.slice(range));
    }

    pub fn write(&self, range: AddressRange, source: &[u8]) {
        self.slice_mut(range).copy_from_slice(source);
    }

    pub fn read_u32(&self, address: u64) -> u32 {
        let mut bytes = [0; 4];
        self.read(AddressRange::from_begin_size(address, 4), &mut bytes);
        u32::from_le_bytes(bytes)
    }

    /// Bytewise comparison against a guest range, memcmp-style.
    pub fn compare(&self, range: AddressRange, data: &[u8]) -> bool {
        self.slice(range) == data
    }
}
