//! # Image Writer
//!
//! Serializes an image on top of the bytes it was loaded from, so everything
//! the rewriter never touched comes out identical. Placement of new bytes:
//!
//! ```text
//! 0                       original end   F0 (page aligned)          end
//! +-------------------------------+......+----------------------+----+----+-----+
//! | original file, patched in     |      | injected region      |grown |  SHT  |
//! | place                         |      | (one PT_LOAD at V0)  |tables| (moved)|
//! +-------------------------------+......+----------------------+------+-------+
//! ```
//!
//! The output is re-read and verified before anything touches the
//! destination, then written to a temporary file beside it and renamed over
//! it.

use std::io::Cursor;
use std::path::Path;

use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::config::RewriteConfig;
use crate::error::{InstrumentError, InstrumentResult};
use crate::header::HeaderField;
use crate::image::ElfImage;
use crate::section::{Placement, SectionField};
use crate::structure::{align_up, BinaryStructure};

/// Assign file offsets to new and grown sections and update the headers
fn assign_layout(image: &mut ElfImage, config: &RewriteConfig) -> InstrumentResult<()> {
    let page = config.page_size;
    let original_len = image.original_bytes().len() as u64;
    let region_vaddr = image.injected_base(page);
    let region_offset = align_up(original_len, page);

    let mut region_end = region_vaddr;
    let mut cursor = original_len;
    let mut injected_alloc = false;

    for index in 0..image.sections().len() {
        let section = image.section(index)?;
        let h = section.header();
        if section.placement() != Placement::Injected || !h.has_alloc_bit() {
            continue;
        }
        if h.addr() < region_vaddr {
            return Err(InstrumentError::structural(format!(
                "injected section {} at 0x{:x} lies below the injected region 0x{:x}",
                section.name(),
                h.addr(),
                region_vaddr
            )));
        }
        let offset = region_offset + (h.addr() - region_vaddr);
        region_end = region_end.max(h.addr() + h.size());
        cursor = cursor.max(offset + h.size());
        injected_alloc = true;
        image
            .section_mut(index)?
            .header_mut()
            .set(SectionField::Offset, offset)?;
    }

    if injected_alloc {
        let size = region_end - region_vaddr;
        match image.injection_slot() {
            Some(slot) => {
                warn!(
                    "program header {} reused as PT_LOAD for 0x{:x} bytes at 0x{:x}",
                    slot, size, region_vaddr
                );
                image.program_headers_mut()[slot].make_load(region_offset, region_vaddr, size, page)?;
            }
            None if image.program_headers().is_empty() => {
                warn!("no program headers: injected region at file offset 0x{:x} is not mapped", region_offset);
            }
            None => {
                return Err(InstrumentError::structural(
                    "no PT_NOTE or PT_NULL program header can be reused to map injected code",
                ))
            }
        }
    }

    for index in 0..image.sections().len() {
        let section = image.section(index)?;
        let h = section.header();
        let moves = match section.placement() {
            Placement::Injected => !h.has_alloc_bit() && h.has_file_contents(),
            Placement::Original { .. } => section.outgrew_placement(),
        };
        if !moves {
            continue;
        }
        let offset = align_up(cursor, h.align().max(1));
        cursor = offset + section.bytes().len() as u64;
        debug!("{} placed at file offset 0x{:x}", section.name(), offset);
        image
            .section_mut(index)?
            .header_mut()
            .set(SectionField::Offset, offset)?;
    }

    if image.sections().len() != image.original_section_count() {
        let shoff = align_up(cursor, image.width().word_size() as u64);
        image.header_mut().set(HeaderField::Shoff, shoff)?;
        debug!("section header table moved to 0x{:x}", shoff);
    }
    let shnum = image.sections().len() as u64;
    image.header_mut().set(HeaderField::Shnum, shnum)?;
    Ok(())
}

/// Serialize `image` to bytes, verifying the result
pub fn serialize(image: &mut ElfImage, config: &RewriteConfig) -> InstrumentResult<Vec<u8>> {
    for index in 0..image.sections().len() {
        image.section_mut(index)?.sync_size()?;
    }
    assign_layout(image, config)?;
    image.verify()?;

    let mut out = Cursor::new(image.original_bytes().to_vec());
    image.header().dump(&mut out, 0)?;

    let phoff = image.header().phoff();
    let phentsize = image.header().get(HeaderField::Phentsize);
    for (i, ph) in image.program_headers().iter().enumerate() {
        ph.dump(&mut out, phoff + i as u64 * phentsize)?;
    }

    for section in image.sections() {
        section.dump(&mut out)?;
    }

    let shoff = image.header().shoff();
    let shentsize = image.header().get(HeaderField::Shentsize);
    for (i, section) in image.sections().iter().enumerate() {
        section.header().dump(&mut out, shoff + i as u64 * shentsize)?;
    }

    let bytes = out.into_inner();

    let reread = ElfImage::from_bytes(bytes.clone())?;
    if reread.sections().len() != image.sections().len() {
        return Err(InstrumentError::structural(format!(
            "serialized image holds {} sections, expected {}",
            reread.sections().len(),
            image.sections().len()
        )));
    }
    if config.validate_output {
        let elf = goblin::elf::Elf::parse(&bytes)?;
        debug!(
            "goblin: {} section headers, {} program headers",
            elf.section_headers.len(),
            elf.program_headers.len()
        );
    }
    Ok(bytes)
}

/// Serialize `image` and atomically replace `path` with the result
pub fn write_image(image: &mut ElfImage, config: &RewriteConfig, path: &Path) -> InstrumentResult<()> {
    let bytes = serialize(image, config)?;

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut temp = NamedTempFile::new_in(dir)?;
    std::io::Write::write_all(&mut temp, &bytes)?;
    temp.as_file().sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(path)
            .map(|m| m.permissions().mode())
            .unwrap_or(0o755);
        std::fs::set_permissions(temp.path(), std::fs::Permissions::from_mode(mode))?;
    }

    temp.persist(path).map_err(|e| InstrumentError::Io(e.error))?;
    info!("wrote {} ({} bytes)", path.display(), bytes.len());
    Ok(())
}
