//! Page layout of the backing index file.
//!
//! A page starts with an 8-byte header followed by packed vertex records:
//! `dimension` little-endian `f32` vector components, `max_degree` `i32`
//! neighbour ids and one `i32` edge count. The cache itself treats pages
//! as opaque bytes; the geometry only decides sizes and file offsets.

use crate::{CacheError, Result};

/// Bytes reserved at the start of every page.
pub const PAGE_HEADER_SIZE: usize = 8;

/// Pages are rounded up to this block size for aligned reads.
pub const BLOCK_SIZE: usize = 4096;

/// Sizes and offsets derived from the vector dimensionality and maximum degree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageGeometry {
    page_size: usize,
    vertex_record_size: usize,
    vertices_per_page: usize,
    vector_offset: usize,
    edges_offset: usize,
    edge_count_offset: usize,
}

impl PageGeometry {
    /// Geometry for vertex records of `dimension` floats and up to
    /// `max_degree` edges, packing as many records as fit one block-rounded page.
    pub fn for_vectors(dimension: usize, max_degree: usize) -> Result<Self> {
        if dimension == 0 {
            return Err(CacheError::invalid_config("vector dimension must be positive"));
        }

        let vector_bytes = dimension * 4;
        let edge_bytes = max_degree * 4;
        let vertex_record_size = vector_bytes + edge_bytes + 4;
        let page_size = (PAGE_HEADER_SIZE + vertex_record_size).div_ceil(BLOCK_SIZE) * BLOCK_SIZE;

        Ok(Self {
            page_size,
            vertex_record_size,
            vertices_per_page: (page_size - PAGE_HEADER_SIZE) / vertex_record_size,
            vector_offset: 0,
            edges_offset: vector_bytes,
            edge_count_offset: vector_bytes + edge_bytes,
        })
    }

    /// Geometry for opaque pages of exactly `page_size` bytes.
    pub fn with_page_size(page_size: usize) -> Result<Self> {
        if page_size <= PAGE_HEADER_SIZE {
            return Err(CacheError::invalid_config(format!(
                "page size {page_size} must exceed the {PAGE_HEADER_SIZE}-byte header"
            )));
        }

        Ok(Self {
            page_size,
            vertex_record_size: page_size - PAGE_HEADER_SIZE,
            vertices_per_page: 1,
            vector_offset: 0,
            edges_offset: 0,
            edge_count_offset: 0,
        })
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[inline]
    pub fn vertex_record_size(&self) -> usize {
        self.vertex_record_size
    }

    #[inline]
    pub fn vertices_per_page(&self) -> usize {
        self.vertices_per_page
    }

    /// Offsets of the vector, edge array and edge count inside a record.
    pub fn field_offsets(&self) -> (usize, usize, usize) {
        (self.vector_offset, self.edges_offset, self.edge_count_offset)
    }

    /// Byte offset of a page in the backing file, or `None` if the page id is
    /// negative or its offset does not fit a `u64`.
    #[inline]
    pub fn page_offset(&self, page_id: i64) -> Option<u64> {
        u64::try_from(page_id)
            .ok()?
            .checked_mul(self.page_size as u64)
    }

    /// Page holding `vertex_id` and the byte offset of its record in that page.
    pub fn vertex_location(&self, vertex_id: u64) -> (i64, usize) {
        let per_page = self.vertices_per_page as u64;
        let page_id = (vertex_id / per_page) as i64;
        let index = (vertex_id % per_page) as usize;
        (page_id, PAGE_HEADER_SIZE + index * self.vertex_record_size)
    }
}

impl Default for PageGeometry {
    fn default() -> Self {
        Self {
            page_size: BLOCK_SIZE,
            vertex_record_size: BLOCK_SIZE - PAGE_HEADER_SIZE,
            vertices_per_page: 1,
            vector_offset: 0,
            edges_offset: 0,
            edge_count_offset: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_vectors_share_a_block() {
        let geometry = PageGeometry::for_vectors(128, 32).unwrap();
        assert_eq!(geometry.vertex_record_size(), 128 * 4 + 32 * 4 + 4);
        assert_eq!(geometry.page_size(), BLOCK_SIZE);
        assert_eq!(geometry.vertices_per_page(), (BLOCK_SIZE - PAGE_HEADER_SIZE) / 644);
        assert_eq!(geometry.field_offsets(), (0, 512, 640));
    }

    #[test]
    fn large_vectors_round_up_to_blocks() {
        let geometry = PageGeometry::for_vectors(1536, 64).unwrap();
        assert_eq!(geometry.page_size() % BLOCK_SIZE, 0);
        assert!(geometry.page_size() >= PAGE_HEADER_SIZE + geometry.vertex_record_size());
        assert_eq!(geometry.vertices_per_page(), 1);
    }

    #[test]
    fn vertex_location_wraps_pages() {
        let geometry = PageGeometry::for_vectors(128, 32).unwrap();
        let per_page = geometry.vertices_per_page() as u64;
        assert_eq!(geometry.vertex_location(0), (0, PAGE_HEADER_SIZE));
        assert_eq!(
            geometry.vertex_location(per_page + 1),
            (1, PAGE_HEADER_SIZE + geometry.vertex_record_size())
        );
        assert_eq!(geometry.page_offset(3), Some(3 * geometry.page_size() as u64));
    }

    #[test]
    fn offsets_past_u64_are_refused() {
        let geometry = PageGeometry::with_page_size(64).unwrap();
        assert_eq!(geometry.page_offset((1 << 58) - 1), Some(((1 << 58) - 1) * 64));
        assert_eq!(geometry.page_offset((1 << 58) + 5), None);
        assert_eq!(geometry.page_offset(i64::MAX), None);
        assert_eq!(geometry.page_offset(-1), None);
    }

    #[test]
    fn degenerate_geometry_is_rejected() {
        assert!(PageGeometry::for_vectors(0, 8).is_err());
        assert!(PageGeometry::with_page_size(PAGE_HEADER_SIZE).is_err());
    }
}
