//! Read-only FAT32 filesystem reader.
//!
//! Parses the BIOS Parameter Block, walks the FAT32 file allocation table,
//! and reads directory/file clusters, all through the [`super::blockdev::BlockDevice`]
//! contract. There is no write path: creating, truncating, or writing a
//! file on a FAT32-backed [`VfsNode`] returns an error rather than
//! mutating the FAT or any cluster.

use alloc::{boxed::Box, string::String, sync::Arc, sync::Weak, vec, vec::Vec};

use spin::RwLock;

use super::blockdev::BlockDevice;
use super::{DirEntry, Filesystem, Metadata, NodeType, Permissions, VfsNode};
use crate::error::KernelError;

/// BIOS Parameter Block field offsets within the first sector.
mod bpb {
    pub const BYTES_PER_SECTOR_OFF: usize = 11;
    pub const SECTORS_PER_CLUSTER_OFF: usize = 13;
    pub const RESERVED_SECTORS_OFF: usize = 14;
    pub const NUM_FATS_OFF: usize = 16;
    pub const TOTAL_SECTORS_16_OFF: usize = 19;
    pub const SECTORS_PER_FAT32_OFF: usize = 36;
    pub const ROOT_CLUSTER_OFF: usize = 44;
    pub const TOTAL_SECTORS_32_OFF: usize = 32;
    pub const SIGNATURE_OFF: usize = 510;
}

/// 32-byte directory entry field offsets.
mod dirent {
    pub const NAME_OFF: usize = 0;
    pub const NAME_LEN: usize = 11;
    pub const ATTR_OFF: usize = 11;
    pub const CLUSTER_HI_OFF: usize = 20;
    pub const CLUSTER_LO_OFF: usize = 26;
    pub const SIZE_OFF: usize = 28;

    pub const ATTR_DIRECTORY: u8 = 0x10;
    pub const ATTR_LONG_NAME: u8 = 0x0F;
    pub const ATTR_VOLUME_ID: u8 = 0x08;

    pub const ENTRY_SIZE: usize = 32;
    pub const FREE_MARKER: u8 = 0xE5;
    pub const END_MARKER: u8 = 0x00;
}

const FAT32_EOC_MIN: u32 = 0x0FFF_FFF8;
const FAT_ENTRY_MASK: u32 = 0x0FFF_FFFF;

fn le16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn le32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

/// Parsed geometry pulled from the BPB, in sectors/clusters rather than
/// raw bytes so the rest of the reader never has to re-derive them.
#[derive(Debug, Clone, Copy)]
struct Geometry {
    bytes_per_sector: u32,
    sectors_per_cluster: u32,
    reserved_sectors: u32,
    num_fats: u32,
    sectors_per_fat: u32,
    root_cluster: u32,
    first_data_sector: u32,
}

impl Geometry {
    fn parse(sector0: &[u8]) -> Result<Self, KernelError> {
        if sector0.len() < 512 || le16(sector0, bpb::SIGNATURE_OFF) != 0xAA55 {
            return Err(KernelError::InvalidArgument {
                name: "fat32",
                value: "missing boot sector signature",
            });
        }
        let bytes_per_sector = le16(sector0, bpb::BYTES_PER_SECTOR_OFF) as u32;
        let sectors_per_cluster = sector0[bpb::SECTORS_PER_CLUSTER_OFF] as u32;
        let reserved_sectors = le16(sector0, bpb::RESERVED_SECTORS_OFF) as u32;
        let num_fats = sector0[bpb::NUM_FATS_OFF] as u32;
        let sectors_per_fat = le32(sector0, bpb::SECTORS_PER_FAT32_OFF);
        let root_cluster = le32(sector0, bpb::ROOT_CLUSTER_OFF);

        if bytes_per_sector == 0 || sectors_per_cluster == 0 || sectors_per_fat == 0 {
            return Err(KernelError::InvalidArgument {
                name: "fat32",
                value: "zero-sized BPB field, not a FAT32 volume",
            });
        }

        let first_data_sector = reserved_sectors + num_fats * sectors_per_fat;
        Ok(Self {
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors,
            num_fats,
            sectors_per_fat,
            root_cluster,
            first_data_sector,
        })
    }

    fn cluster_to_sector(&self, cluster: u32) -> u64 {
        u64::from(self.first_data_sector) + u64::from((cluster - 2) * self.sectors_per_cluster)
    }

    fn bytes_per_cluster(&self) -> usize {
        (self.bytes_per_sector * self.sectors_per_cluster) as usize
    }
}

/// A read-only FAT32 volume mounted over a [`BlockDevice`].
pub struct Fat32Fs {
    device: RwLock<Box<dyn BlockDevice>>,
    geometry: Geometry,
    /// Nodes need an owned handle back to the filesystem to walk clusters
    /// on demand; `Arc::new_cyclic` wires this up at construction time
    /// since `root()` only ever gets `&self`.
    self_ref: Weak<Fat32Fs>,
}

impl Fat32Fs {
    /// Reads the boot sector and FAT from `device` and validates it's a
    /// FAT32 volume.
    pub fn mount(device: Box<dyn BlockDevice>) -> Result<Arc<Self>, KernelError> {
        let sector_size = device.sector_size();
        let mut sector0 = vec![0u8; sector_size];
        device.read_sectors(0, &mut sector0)?;
        let geometry = Geometry::parse(&sector0)?;

        Ok(Arc::new_cyclic(|self_ref| Self {
            device: RwLock::new(device),
            geometry,
            self_ref: self_ref.clone(),
        }))
    }

    fn read_sector(&self, sector: u64, buf: &mut [u8]) -> Result<(), KernelError> {
        self.device.read().read_sectors(sector, buf)
    }

    /// Reads the FAT entry for `cluster`, returning either the next
    /// cluster in the chain or `None` at end-of-chain.
    fn next_cluster(&self, cluster: u32) -> Result<Option<u32>, KernelError> {
        let fat_byte_off = cluster as u64 * 4;
        let sector_size = u64::from(self.geometry.bytes_per_sector);
        let fat_sector = u64::from(self.geometry.reserved_sectors) + fat_byte_off / sector_size;
        let offset_in_sector = (fat_byte_off % sector_size) as usize;

        let mut buf = vec![0u8; self.geometry.bytes_per_sector as usize];
        self.read_sector(fat_sector, &mut buf)?;
        let raw = le32(&buf, offset_in_sector) & FAT_ENTRY_MASK;

        if raw >= FAT32_EOC_MIN || raw == 0 {
            Ok(None)
        } else {
            Ok(Some(raw))
        }
    }

    /// Reads every cluster in the chain starting at `start_cluster`,
    /// concatenated in order.
    fn read_cluster_chain(&self, start_cluster: u32) -> Result<Vec<u8>, KernelError> {
        let mut data = Vec::new();
        let mut cluster = start_cluster;
        let cluster_bytes = self.geometry.bytes_per_cluster();
        // FAT32 clusters form a linked list on-disk; a corrupt FAT can loop
        // forever, so cap the walk at a generous cluster count instead of
        // trusting the chain to terminate.
        for _ in 0..1_000_000u32 {
            let sector = self.geometry.cluster_to_sector(cluster);
            let mut buf = vec![0u8; cluster_bytes];
            self.read_sector(sector, &mut buf)?;
            data.extend_from_slice(&buf);

            match self.next_cluster(cluster)? {
                Some(next) => cluster = next,
                None => return Ok(data),
            }
        }
        Err(KernelError::InvalidArgument {
            name: "fat32",
            value: "cluster chain did not terminate",
        })
    }

    fn parse_directory(&self, raw: &[u8]) -> Vec<Fat32Entry> {
        let mut entries = Vec::new();
        for chunk in raw.chunks_exact(dirent::ENTRY_SIZE) {
            let first_byte = chunk[dirent::NAME_OFF];
            if first_byte == dirent::END_MARKER {
                break;
            }
            if first_byte == dirent::FREE_MARKER {
                continue;
            }
            let attr = chunk[dirent::ATTR_OFF];
            if attr == dirent::ATTR_LONG_NAME || attr & dirent::ATTR_VOLUME_ID != 0 {
                continue;
            }

            let name = parse_short_name(&chunk[dirent::NAME_OFF..dirent::NAME_OFF + dirent::NAME_LEN]);
            let cluster_hi = le16(chunk, dirent::CLUSTER_HI_OFF) as u32;
            let cluster_lo = le16(chunk, dirent::CLUSTER_LO_OFF) as u32;
            let cluster = (cluster_hi << 16) | cluster_lo;
            let size = le32(chunk, dirent::SIZE_OFF);
            let is_dir = attr & dirent::ATTR_DIRECTORY != 0;

            entries.push(Fat32Entry {
                name,
                cluster,
                size,
                is_dir,
            });
        }
        entries
    }

    fn directory_entries(&self, cluster: u32) -> Result<Vec<Fat32Entry>, KernelError> {
        let raw = self.read_cluster_chain(cluster)?;
        Ok(self.parse_directory(&raw))
    }
}

/// Converts an 8.3 short name (`"README  TXT"`) into `"README.TXT"`.
fn parse_short_name(raw: &[u8]) -> String {
    let base = core::str::from_utf8(&raw[0..8]).unwrap_or("").trim_end();
    let ext = core::str::from_utf8(&raw[8..11]).unwrap_or("").trim_end();
    if ext.is_empty() {
        String::from(base)
    } else {
        alloc::format!("{}.{}", base, ext)
    }
}

struct Fat32Entry {
    name: String,
    cluster: u32,
    size: u32,
    is_dir: bool,
}

impl Filesystem for Fat32Fs {
    fn root(&self) -> Arc<dyn VfsNode> {
        let fs = self
            .self_ref
            .upgrade()
            .expect("Fat32Fs::root called after the filesystem was dropped");
        Arc::new(Fat32Node {
            fs,
            cluster: self.geometry.root_cluster,
            size: 0,
            is_dir: true,
        })
    }

    fn name(&self) -> &str {
        "fat32"
    }

    fn is_readonly(&self) -> bool {
        true
    }

    fn sync(&self) -> Result<(), &'static str> {
        Ok(())
    }
}

/// A file or directory within a mounted FAT32 volume.
pub struct Fat32Node {
    fs: Arc<Fat32Fs>,
    cluster: u32,
    size: u32,
    is_dir: bool,
}

impl VfsNode for Fat32Node {
    fn node_type(&self) -> NodeType {
        if self.is_dir {
            NodeType::Directory
        } else {
            NodeType::File
        }
    }

    fn read(&self, offset: usize, buffer: &mut [u8]) -> Result<usize, &'static str> {
        if self.is_dir {
            return Err("is a directory");
        }
        let data = self
            .fs
            .read_cluster_chain(self.cluster)
            .map_err(|_| "I/O error reading FAT32 cluster chain")?;
        let file_len = self.size as usize;
        if offset >= file_len {
            return Ok(0);
        }
        let end = (offset + buffer.len()).min(file_len).min(data.len());
        let n = end - offset;
        buffer[..n].copy_from_slice(&data[offset..end]);
        Ok(n)
    }

    fn write(&self, _offset: usize, _data: &[u8]) -> Result<usize, &'static str> {
        Err("FAT32 mount is read-only")
    }

    fn metadata(&self) -> Result<Metadata, &'static str> {
        Ok(Metadata {
            node_type: self.node_type(),
            size: self.size as usize,
            permissions: Permissions::read_only(),
            uid: 0,
            gid: 0,
            created: 0,
            modified: 0,
            accessed: 0,
        })
    }

    fn readdir(&self) -> Result<Vec<DirEntry>, &'static str> {
        if !self.is_dir {
            return Err("not a directory");
        }
        let entries = self
            .fs
            .directory_entries(self.cluster)
            .map_err(|_| "I/O error reading FAT32 directory")?;
        Ok(entries
            .iter()
            .map(|e| DirEntry {
                name: e.name.clone(),
                node_type: if e.is_dir {
                    NodeType::Directory
                } else {
                    NodeType::File
                },
                inode: u64::from(e.cluster),
            })
            .collect())
    }

    fn lookup(&self, name: &str) -> Result<Arc<dyn VfsNode>, &'static str> {
        if !self.is_dir {
            return Err("not a directory");
        }
        let entries = self
            .fs
            .directory_entries(self.cluster)
            .map_err(|_| "I/O error reading FAT32 directory")?;
        let entry = entries
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(name))
            .ok_or("no such file or directory")?;
        Ok(Arc::new(Fat32Node {
            fs: self.fs.clone(),
            cluster: entry.cluster,
            size: entry.size,
            is_dir: entry.is_dir,
        }))
    }

    fn create(&self, _name: &str, _permissions: Permissions) -> Result<Arc<dyn VfsNode>, &'static str> {
        Err("FAT32 mount is read-only")
    }

    fn mkdir(&self, _name: &str, _permissions: Permissions) -> Result<Arc<dyn VfsNode>, &'static str> {
        Err("FAT32 mount is read-only")
    }

    fn unlink(&self, _name: &str) -> Result<(), &'static str> {
        Err("FAT32 mount is read-only")
    }

    fn truncate(&self, _size: usize) -> Result<(), &'static str> {
        Err("FAT32 mount is read-only")
    }
}

#[cfg(test)]
mod tests {
    use alloc::string::ToString;

    use super::*;
    use crate::fs::blockdev::RamBlockDevice;

    fn format_minimal_fat32(sectors_per_cluster: u8) -> RamBlockDevice {
        let sector_size = 512usize;
        let reserved = 8u32;
        let num_fats = 1u32;
        let sectors_per_fat = 4u32;
        let total_sectors = 2048u64;

        let mut dev = RamBlockDevice::new("test".to_string(), sector_size, total_sectors);

        let mut boot = vec![0u8; sector_size];
        boot[bpb::BYTES_PER_SECTOR_OFF..bpb::BYTES_PER_SECTOR_OFF + 2]
            .copy_from_slice(&(sector_size as u16).to_le_bytes());
        boot[bpb::SECTORS_PER_CLUSTER_OFF] = sectors_per_cluster;
        boot[bpb::RESERVED_SECTORS_OFF..bpb::RESERVED_SECTORS_OFF + 2]
            .copy_from_slice(&(reserved as u16).to_le_bytes());
        boot[bpb::NUM_FATS_OFF] = num_fats as u8;
        boot[bpb::SECTORS_PER_FAT32_OFF..bpb::SECTORS_PER_FAT32_OFF + 4]
            .copy_from_slice(&sectors_per_fat.to_le_bytes());
        boot[bpb::ROOT_CLUSTER_OFF..bpb::ROOT_CLUSTER_OFF + 4].copy_from_slice(&2u32.to_le_bytes());
        boot[bpb::SIGNATURE_OFF..bpb::SIGNATURE_OFF + 2].copy_from_slice(&0xAA55u16.to_le_bytes());
        dev.write_sectors(0, &boot).unwrap();

        // Mark cluster 2 (the root dir) as end-of-chain in the FAT.
        let mut fat_sector = vec![0u8; sector_size];
        fat_sector[8..12].copy_from_slice(&0x0FFF_FFFFu32.to_le_bytes());
        dev.write_sectors(u64::from(reserved), &fat_sector).unwrap();

        dev
    }

    #[test]
    fn rejects_volume_without_boot_signature() {
        let dev = RamBlockDevice::new("bad".to_string(), 512, 16);
        let result = Fat32Fs::mount(Box::new(dev));
        assert!(result.is_err());
    }

    #[test]
    fn mounts_a_well_formed_volume() {
        let dev = format_minimal_fat32(1);
        let fs = Fat32Fs::mount(Box::new(dev)).unwrap();
        assert_eq!(fs.geometry.root_cluster, 2);
        assert!(fs.is_readonly());
    }

    #[test]
    fn empty_root_directory_has_no_entries() {
        let dev = format_minimal_fat32(1);
        let fs = Fat32Fs::mount(Box::new(dev)).unwrap();
        let entries = fs.directory_entries(fs.geometry.root_cluster).unwrap();
        assert!(entries.is_empty());
    }
}
