// Cluster size and FAT size calculation for FAT32
// Ensures the cluster count stays at or above 65525

use super::constants::*;
use serde::{Deserialize, Serialize};
use winstick_core::{Result, WinstickError};

/// Geometry of a FAT32 volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fat32Params {
    pub bytes_per_sector: u32,
    pub sectors_per_cluster: u32,
    pub reserved_sectors: u32,
    pub sectors_per_fat: u32,
    pub total_sectors: u32,
    pub cluster_count: u32,
}

impl Fat32Params {
    /// Compute parameters for a volume of `total_sectors` sectors.
    pub fn compute(total_sectors: u64, bytes_per_sector: u32) -> Result<Self> {
        if !matches!(bytes_per_sector, 512 | 1024 | 2048 | 4096) {
            return Err(WinstickError::InvalidLayout(format!(
                "FAT32 does not support {}-byte sectors",
                bytes_per_sector
            )));
        }
        let total = u32::try_from(total_sectors).map_err(|_| {
            WinstickError::InvalidLayout(format!(
                "{} sectors exceed the FAT32 sector count field",
                total_sectors
            ))
        })?;
        let volume_bytes = total_sectors * bytes_per_sector as u64;

        // Start from the usual cluster size for the volume size
        let cluster_bytes: u64 = if volume_bytes <= 260 * MIB {
            512 // 512B clusters for <= 260MB
        } else if volume_bytes <= 8 * GIB {
            4096 // 4KB clusters for <= 8GB
        } else if volume_bytes <= 16 * GIB {
            8192 // 8KB clusters for <= 16GB
        } else if volume_bytes <= 32 * GIB {
            16384 // 16KB clusters for <= 32GB
        } else {
            32768 // 32KB clusters beyond
        };
        let mut sectors_per_cluster = (cluster_bytes / bytes_per_sector as u64).max(1) as u32;

        loop {
            let (sectors_per_fat, clusters) =
                Self::fat_size(total, bytes_per_sector, sectors_per_cluster);
            // Adjust cluster size if we have too few clusters
            if clusters < FAT32_MIN_CLUSTERS as u64 && sectors_per_cluster > 1 {
                sectors_per_cluster /= 2;
                continue;
            }
            if clusters < FAT32_MIN_CLUSTERS as u64 {
                return Err(WinstickError::InsufficientSpace {
                    required: Self::min_sectors(bytes_per_sector),
                    available: total_sectors,
                });
            }
            if clusters > FAT32_MAX_CLUSTERS as u64 {
                return Err(WinstickError::InvalidLayout(format!(
                    "{} clusters exceed the FAT32 limit",
                    clusters
                )));
            }
            return Ok(Self {
                bytes_per_sector,
                sectors_per_cluster,
                reserved_sectors: FAT32_RESERVED_SECTORS,
                sectors_per_fat,
                total_sectors: total,
                cluster_count: clusters as u32,
            });
        }
    }

    /// Smallest FAT that covers the clusters left after it is carved out.
    fn fat_size(total: u32, bytes_per_sector: u32, sectors_per_cluster: u32) -> (u32, u64) {
        let clusters_for = |sectors_per_fat: u64| {
            let overhead = FAT32_RESERVED_SECTORS as u64 + FAT32_NUM_FATS as u64 * sectors_per_fat;
            (total as u64).saturating_sub(overhead) / sectors_per_cluster as u64
        };
        // 4 bytes per entry, +2 for reserved entries
        let needed = |sectors_per_fat: u64| {
            ((clusters_for(sectors_per_fat) + 2) * 4).div_ceil(bytes_per_sector as u64)
        };

        let mut sectors_per_fat = 1u64;
        loop {
            let next = needed(sectors_per_fat);
            if next <= sectors_per_fat {
                break;
            }
            sectors_per_fat = next;
        }
        // The first fit can overshoot; walk back while a smaller FAT still fits
        while sectors_per_fat > 1 && needed(sectors_per_fat - 1) <= sectors_per_fat - 1 {
            sectors_per_fat -= 1;
        }
        (sectors_per_fat as u32, clusters_for(sectors_per_fat))
    }

    /// Smallest FAT32 volume for a sector size: one-sector clusters and
    /// exactly the minimum cluster count.
    pub fn min_sectors(bytes_per_sector: u32) -> u64 {
        let fat = ((FAT32_MIN_CLUSTERS as u64 + 2) * 4).div_ceil(bytes_per_sector as u64);
        FAT32_RESERVED_SECTORS as u64 + FAT32_NUM_FATS as u64 * fat + FAT32_MIN_CLUSTERS as u64
    }

    pub fn cluster_bytes(&self) -> u64 {
        self.sectors_per_cluster as u64 * self.bytes_per_sector as u64
    }

    /// Volume-relative sector of copy `index` of the FAT.
    pub fn fat_start(&self, index: u32) -> u64 {
        self.reserved_sectors as u64 + index as u64 * self.sectors_per_fat as u64
    }

    pub fn data_start(&self) -> u64 {
        self.fat_start(FAT32_NUM_FATS)
    }

    /// Volume-relative first sector of a data cluster (clusters start at 2).
    pub fn cluster_sector(&self, cluster: u32) -> u64 {
        self.data_start() + (cluster as u64 - 2) * self.sectors_per_cluster as u64
    }

    /// Bytes rounded up to whole clusters.
    pub fn round_to_clusters(&self, bytes: u64) -> u64 {
        bytes.div_ceil(self.cluster_bytes()) * self.cluster_bytes()
    }

    /// Bytes available to files and directories.
    pub fn data_bytes(&self) -> u64 {
        self.cluster_count as u64 * self.cluster_bytes()
    }
}

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;
