//! Transfer Completion — a reference-counted callback invoked when a
//! stream fence retires (§4.7).

use crate::descriptor::XferDes;

pub struct TransferCompletion {
    descriptor: XferDes,
    read_port_idx: i32,
    read_offset: u64,
    read_size: u64,
    write_port_idx: i32,
    write_offset: u64,
    write_size: u64,
}

impl TransferCompletion {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        descriptor: XferDes,
        read_port_idx: i32,
        read_offset: u64,
        read_size: u64,
        write_port_idx: i32,
        write_offset: u64,
        write_size: u64,
    ) -> Self {
        TransferCompletion { descriptor, read_port_idx, read_offset, read_size, write_port_idx, write_offset, write_size }
    }

    /// Consumes the completion, applying byte-progress updates and
    /// releasing the reference the channel took when it created this
    /// fence. The release is implicit: dropping `self.descriptor` at the
    /// end of this call is the "remove_reference" the spec calls for.
    pub fn complete(self) {
        if self.read_port_idx >= 0 {
            self.descriptor.update_bytes_read(self.read_port_idx, self.read_offset, self.read_size);
        }
        if self.write_port_idx >= 0 {
            self.descriptor.update_bytes_write(self.write_port_idx, self.write_offset, self.write_size);
        }
    }
}
