use std::io;
use std::path::PathBuf;

use clap::Parser;

use vhost_user_blk::blk::SECTOR_SIZE;
use vhost_user_blk::device::BlockBackend;
use vhost_user_blk::virtqueue::Buffer;
use vhost_user_blk::VhostDev;

const MAX_QUEUES: usize = 1;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path of the vhost-user control socket to listen on.
    socket_path: PathBuf,

    /// Ramdisk size in MiB.
    #[arg(long, default_value_t = 64)]
    size_mb: u64,

    /// Reject write/flush requests from the guest.
    #[arg(long)]
    readonly: bool,

    /// Advertise VIRTIO_BLK_F_FLUSH so the guest issues cache flushes.
    #[arg(long)]
    writeback: bool,
}

struct RamDisk {
    data: Vec<u8>,
    serial: Vec<u8>,
    readonly: bool,
    writeback: bool,
}

impl RamDisk {
    fn new(size_mb: u64, readonly: bool, writeback: bool) -> Self {
        RamDisk {
            data: vec![0u8; (size_mb * 1024 * 1024) as usize],
            serial: b"vhost-user-blk-ramdisk".to_vec(),
            readonly,
            writeback,
        }
    }
}

impl BlockBackend for RamDisk {
    fn capacity_sectors(&self) -> u64 {
        self.data.len() as u64 / SECTOR_SIZE
    }

    fn block_size(&self) -> u32 {
        512
    }

    fn readonly(&self) -> bool {
        self.readonly
    }

    fn writeback(&self) -> bool {
        self.writeback
    }

    fn serial(&self) -> &[u8] {
        &self.serial
    }

    fn read(&mut self, sector: u64, buffers: &[Buffer]) -> io::Result<u32> {
        let mut offset = (sector * SECTOR_SIZE) as usize;
        let mut total = 0u32;
        for buf in buffers {
            let len = buf.len as usize;
            let end = offset.checked_add(len).ok_or_else(out_of_range)?;
            let src = self.data.get(offset..end).ok_or_else(out_of_range)?;
            // SAFETY: buf.ptr was resolved through the guest memory map
            // with write access for this exact length.
            unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), buf.ptr, len) };
            offset = end;
            total += buf.len;
        }
        Ok(total)
    }

    fn write(&mut self, sector: u64, buffers: &[Buffer]) -> io::Result<()> {
        let mut offset = (sector * SECTOR_SIZE) as usize;
        for buf in buffers {
            let len = buf.len as usize;
            let end = offset.checked_add(len).ok_or_else(out_of_range)?;
            let dst = self.data.get_mut(offset..end).ok_or_else(out_of_range)?;
            // SAFETY: buf.ptr was resolved through the guest memory map
            // with read access for this exact length.
            unsafe { std::ptr::copy_nonoverlapping(buf.ptr, dst.as_mut_ptr(), len) };
            offset = end;
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn out_of_range() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, "request past end of ramdisk")
}

fn main() -> io::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let backend = RamDisk::new(args.size_mb, args.readonly, args.writeback);
    log::info!(
        "vhost-user-blk: serving {} MiB ramdisk on {:?}",
        args.size_mb,
        args.socket_path
    );

    let mut dev = VhostDev::bind(&args.socket_path, backend, MAX_QUEUES)?;
    dev.run()
}
