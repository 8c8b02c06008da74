//! # Instrumentation Engine
//!
//! Runs one tool over one image in two phases:
//!
//! ```text
//!   Loaded --declare()--> Declared --instrument()--> Instrumented --write()--> Serialized
//!            functions,               trampolines,                  bytes on
//!            data blocks,             descriptor table,             disk
//!            .inst.data/.inst.text    code patched
//! ```
//!
//! Every phase checks the current state first and fails with a sequencing
//! error, leaving the image untouched, when called out of order. The instrument
//! phase validates and encodes every patch before the first byte of the image
//! changes.

use std::fmt;
use std::path::Path;

use goblin::elf::section_header::{SHF_EXECINSTR, SHF_WRITE, SHT_PROGBITS};
use tracing::{debug, info, warn};

use crate::codegen::{self, Arch, BRANCH_SIZE};
use crate::config::RewriteConfig;
use crate::descriptor::{
    InstrumentationPoint, PatchTarget, TableHeader, MAX_PATCH_BYTES, POINT_RECORD, TABLE_HEADER,
    TABLE_SYMBOL,
};
use crate::error::{InstrumentError, InstrumentResult};
use crate::image::{alloc_flags, ElfImage, NewSection};
use crate::section::{SectionContents, SectionKind};
use crate::sites::PatchSite;
use crate::structure::{align_up, Endian};
use crate::symbol::SymbolKind;
use crate::tools::InstrumentationTool;
use crate::writer;

/// Alignment of every injected function body and trampoline
const CODE_ALIGN: u64 = 16;
const PADDING: u8 = 0xCC;

/// Routine the C runtime calls on the way out of the program
const FINI_SYMBOL: &str = "_fini";
const FINI_SECTION: &str = ".fini";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Loaded,
    Declared,
    Instrumented,
    Serialized,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Loaded => write!(f, "Loaded"),
            EngineState::Declared => write!(f, "Declared"),
            EngineState::Instrumented => write!(f, "Instrumented"),
            EngineState::Serialized => write!(f, "Serialized"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DataId(usize);

/// Machine code of an injected function
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FunctionBody {
    /// Return immediately
    Stub,
    /// Tail-jump to an existing address
    Forward { target: u64 },
    /// Increment the 64-bit counter selected by the site index
    Counter { data: DataId },
    /// Position-independent code supplied from outside
    Opaque(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct InstrumentationFunction {
    name: String,
    body: FunctionBody,
    address: Option<u64>,
}

impl InstrumentationFunction {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn body(&self) -> &FunctionBody {
        &self.body
    }

    /// Entry address, known once the declare phase has finished
    pub fn address(&self) -> Option<u64> {
        self.address
    }
}

#[derive(Debug, Clone)]
struct DataBlock {
    name: String,
    size: u64,
    address: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PatchRequest {
    Point {
        site: u32,
        function: FunctionId,
        at: PatchSite,
    },
    Call {
        site: u32,
        function: FunctionId,
        address: u64,
        callee: u64,
    },
}

impl PatchRequest {
    fn span(&self) -> PatchSite {
        match self {
            PatchRequest::Point { at, .. } => *at,
            PatchRequest::Call { address, .. } => PatchSite::new(*address, BRANCH_SIZE as u8),
        }
    }
}

/// Everything the instrument phase will write, computed up front
struct Plan {
    trampolines: Vec<u8>,
    trampoline_base: u64,
    site_ids: Vec<u8>,
    site_ids_vaddr: u64,
    records: Vec<u8>,
    points_vaddr: u64,
    points: Vec<InstrumentationPoint>,
    header: TableHeader,
    new_entry: Option<u64>,
    exit_patch: Option<(u64, Vec<u8>)>,
}

pub struct Instrumenter {
    image: ElfImage,
    config: RewriteConfig,
    arch: Arch,
    state: EngineState,
    functions: Vec<InstrumentationFunction>,
    data: Vec<DataBlock>,
    entry_hook: Option<FunctionId>,
    exit_hook: Option<FunctionId>,
    site_ids: Vec<u64>,
    requests: Vec<PatchRequest>,
    table_vaddr: Option<u64>,
    points: Vec<InstrumentationPoint>,
}

impl Instrumenter {
    pub fn new(image: ElfImage, config: RewriteConfig) -> InstrumentResult<Self> {
        config.validate()?;
        let arch = Arch::from_machine(image.machine())?;
        debug!("engine for {} image", arch.name());
        Ok(Self {
            image,
            config,
            arch,
            state: EngineState::Loaded,
            functions: Vec::new(),
            data: Vec::new(),
            entry_hook: None,
            exit_hook: None,
            site_ids: Vec::new(),
            requests: Vec::new(),
            table_vaddr: None,
            points: Vec::new(),
        })
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn image(&self) -> &ElfImage {
        &self.image
    }

    pub fn config(&self) -> &RewriteConfig {
        &self.config
    }

    pub fn into_image(self) -> ElfImage {
        self.image
    }

    fn expect_state(&self, expected: EngineState, operation: &str) -> InstrumentResult<()> {
        if self.state != expected {
            return Err(InstrumentError::Sequencing {
                state: self.state.to_string(),
                operation: operation.to_string(),
            });
        }
        Ok(())
    }

    fn name_taken(&self, name: &str) -> InstrumentResult<bool> {
        Ok(self.functions.iter().any(|f| f.name == name)
            || self.data.iter().any(|d| d.name == name)
            || self.image.has_symbol(name)?)
    }

    /// `base`, or `base_N` for the first N that no symbol uses yet
    fn unique_name(&self, base: &str) -> InstrumentResult<String> {
        if !self.name_taken(base)? {
            return Ok(base.to_string());
        }
        let mut n = 1;
        loop {
            let candidate = format!("{}_{}", base, n);
            if !self.name_taken(&candidate)? {
                debug!("symbol {} exists, using {}", base, candidate);
                return Ok(candidate);
            }
            n += 1;
        }
    }

    // ---- declare phase ----

    /// Register an instrumentation function. A body configured for `name`
    /// replaces `body`.
    pub fn declare_function(&mut self, name: &str, body: FunctionBody) -> InstrumentResult<FunctionId> {
        self.expect_state(EngineState::Loaded, "declare a function")?;
        if let FunctionBody::Counter { data } = body {
            self.data_block(data)?;
        }
        let body = match self.config.body_override(name)? {
            Some(code) => FunctionBody::Opaque(code),
            None => body,
        };
        let unique = self.unique_name(name)?;
        self.functions.push(InstrumentationFunction {
            name: unique,
            body,
            address: None,
        });
        Ok(FunctionId(self.functions.len() - 1))
    }

    /// Reserve zeroed, writable data of `size` bytes
    pub fn reserve_data(&mut self, name: &str, size: u64) -> InstrumentResult<DataId> {
        self.expect_state(EngineState::Loaded, "reserve data")?;
        let unique = self.unique_name(name)?;
        self.data.push(DataBlock {
            name: unique,
            size,
            address: None,
        });
        Ok(DataId(self.data.len() - 1))
    }

    /// Call `function(table)` before the original entry point
    pub fn set_entry_hook(&mut self, function: FunctionId) -> InstrumentResult<()> {
        self.expect_state(EngineState::Loaded, "set the entry hook")?;
        self.function(function)?;
        self.entry_hook = Some(function);
        Ok(())
    }

    /// Call `function(table)` when the program exits through `_fini`; the
    /// address is also recorded in the table
    pub fn set_exit_hook(&mut self, function: FunctionId) -> InstrumentResult<()> {
        self.expect_state(EngineState::Loaded, "set the exit hook")?;
        self.function(function)?;
        self.exit_hook = Some(function);
        Ok(())
    }

    pub fn function(&self, id: FunctionId) -> InstrumentResult<&InstrumentationFunction> {
        self.functions.get(id.0).ok_or_else(|| {
            InstrumentError::out_of_range("function id", id.0 as u64, self.functions.len() as u64)
        })
    }

    pub fn functions(&self) -> &[InstrumentationFunction] {
        &self.functions
    }

    fn data_block(&self, id: DataId) -> InstrumentResult<&DataBlock> {
        self.data
            .get(id.0)
            .ok_or_else(|| InstrumentError::out_of_range("data id", id.0 as u64, self.data.len() as u64))
    }

    pub fn data_address(&self, id: DataId) -> InstrumentResult<Option<u64>> {
        Ok(self.data_block(id)?.address)
    }

    /// Address of the descriptor table header
    pub fn table_address(&self) -> Option<u64> {
        self.table_vaddr
    }

    /// Run the tool's declare phase and lay out the declared code and data
    pub fn declare<T: InstrumentationTool + ?Sized>(&mut self, tool: &mut T) -> InstrumentResult<()> {
        self.expect_state(EngineState::Loaded, "declare")?;
        let name = tool.info().name;

        if self.image.program_headers().is_empty() {
            warn!("image has no program headers; injected code will not be mapped");
        } else if self.image.injection_slot().is_none() {
            return Err(InstrumentError::structural(
                "no PT_NOTE or PT_NULL program header can be reused to map injected code",
            ));
        }

        if let Err(e) = tool.declare(self).and_then(|_| self.lay_out_declared()) {
            self.functions.clear();
            self.data.clear();
            self.entry_hook = None;
            self.exit_hook = None;
            self.table_vaddr = None;
            return Err(e);
        }
        self.state = EngineState::Declared;
        info!(
            "{}: declared {} functions, {} data blocks",
            name,
            self.functions.len(),
            self.data.len()
        );
        Ok(())
    }

    fn encode_body(&self, body: &FunctionBody, at: u64) -> InstrumentResult<Vec<u8>> {
        match body {
            FunctionBody::Stub => Ok(codegen::stub_body()),
            FunctionBody::Forward { target } => codegen::forward_body(at, *target),
            FunctionBody::Counter { data } => {
                let counters = self.data_block(*data)?.address.ok_or_else(|| {
                    InstrumentError::structural("counter block has no address")
                })?;
                codegen::counter_body(self.arch, at, counters)
            }
            FunctionBody::Opaque(code) => Ok(code.clone()),
        }
    }

    fn lay_out_declared(&mut self) -> InstrumentResult<()> {
        let page = self.config.page_size;
        let endian = self.image.endian();
        let base = self.image.next_free_address(page, page);

        let mut data = vec![0u8; TABLE_HEADER.size];
        let mut data_addresses = Vec::with_capacity(self.data.len());
        for block in &self.data {
            let offset = align_up(data.len() as u64, 16);
            data.resize((offset + block.size) as usize, 0);
            data_addresses.push(base + offset);
        }
        for (block, address) in self.data.iter_mut().zip(data_addresses) {
            block.address = Some(address);
        }

        let header = TableHeader {
            self_vaddr: base,
            counters_vaddr: self.data.first().and_then(|d| d.address).unwrap_or(0),
            ..Default::default()
        };
        data[..TABLE_HEADER.size].copy_from_slice(&header.encode(endian)?);

        let text_base = align_up(base + data.len() as u64, CODE_ALIGN);
        let mut text = Vec::new();
        let mut entries = Vec::with_capacity(self.functions.len());
        for function in &self.functions {
            let offset = align_up(text.len() as u64, CODE_ALIGN);
            text.resize(offset as usize, PADDING);
            let body = self.encode_body(&function.body, text_base + offset)?;
            text.extend_from_slice(&body);
            entries.push((text_base + offset, body.len() as u64));
        }

        let prefix_data = self.config.section_name("data");
        let data_index = self.image.add_section(NewSection {
            name: prefix_data,
            sh_type: SHT_PROGBITS,
            flags: alloc_flags(SHF_WRITE),
            addr: base,
            align: 16,
            entsize: 0,
            link: 0,
            info: 0,
            contents: SectionContents::Bytes(data),
        })?;
        let table_name = self.unique_name(TABLE_SYMBOL)?;
        self.image
            .add_symbol(&table_name, SymbolKind::Object, base, TABLE_HEADER.size as u64, data_index)?;
        for block in &self.data {
            let address = block.address.unwrap_or(base);
            self.image
                .add_symbol(&block.name, SymbolKind::Object, address, block.size, data_index)?;
        }
        self.table_vaddr = Some(base);

        if !text.is_empty() {
            let text_index = self.image.add_section(NewSection {
                name: self.config.section_name("text"),
                sh_type: SHT_PROGBITS,
                flags: alloc_flags(SHF_EXECINSTR),
                addr: text_base,
                align: CODE_ALIGN,
                entsize: 0,
                link: 0,
                info: 0,
                contents: SectionContents::Bytes(text),
            })?;
            for (function, (address, size)) in self.functions.iter_mut().zip(entries) {
                function.address = Some(address);
                self.image
                    .add_symbol(&function.name, SymbolKind::Function, address, size, text_index)?;
                debug!("function {} at 0x{:x} ({} bytes)", function.name, address, size);
            }
        }
        Ok(())
    }

    // ---- instrument phase ----

    /// Start a new site and return its index; `id` is the block id, loop
    /// hash or function address the runtime sees for this site
    pub fn add_site(&mut self, id: u64) -> InstrumentResult<u32> {
        self.expect_state(EngineState::Declared, "add a site")?;
        let index = u32::try_from(self.site_ids.len())
            .map_err(|_| InstrumentError::out_of_range("site count", self.site_ids.len() as u64, u32::MAX as u64))?;
        self.site_ids.push(id);
        Ok(index)
    }

    fn check_site_index(&self, site: u32) -> InstrumentResult<()> {
        if site as usize >= self.site_ids.len() {
            return Err(InstrumentError::out_of_range(
                "site index",
                site as u64,
                self.site_ids.len() as u64,
            ));
        }
        Ok(())
    }

    /// Call `function(site)` before the instructions at `at` run
    pub fn add_point(&mut self, site: u32, function: FunctionId, at: PatchSite) -> InstrumentResult<()> {
        self.expect_state(EngineState::Declared, "add a point")?;
        self.check_site_index(site)?;
        self.function(function)?;
        self.requests.push(PatchRequest::Point { site, function, at });
        Ok(())
    }

    /// Retarget the `call rel32` at `address`, which must currently call
    /// `callee`, at `function`
    pub fn redirect_call(&mut self, site: u32, function: FunctionId, address: u64, callee: u64) -> InstrumentResult<()> {
        self.expect_state(EngineState::Declared, "redirect a call")?;
        self.check_site_index(site)?;
        self.function(function)?;
        self.requests.push(PatchRequest::Call {
            site,
            function,
            address,
            callee,
        });
        Ok(())
    }

    pub fn site_ids(&self) -> &[u64] {
        &self.site_ids
    }

    /// Descriptors of every patched point, in address order
    pub fn points(&self) -> &[InstrumentationPoint] {
        &self.points
    }

    /// Run the tool's instrument phase and apply the resulting patches
    pub fn instrument<T: InstrumentationTool + ?Sized>(&mut self, tool: &mut T) -> InstrumentResult<()> {
        self.expect_state(EngineState::Declared, "instrument")?;
        let name = tool.info().name;

        let plan = tool.instrument(self).and_then(|_| self.plan());
        let plan = match plan {
            Ok(plan) => plan,
            Err(e) => {
                self.requests.clear();
                self.site_ids.clear();
                return Err(e);
            }
        };

        self.commit(plan)?;
        self.state = EngineState::Instrumented;
        info!(
            "{}: {} points over {} sites",
            name,
            self.points.len(),
            self.site_ids.len()
        );
        Ok(())
    }

    fn function_address(&self, id: FunctionId) -> InstrumentResult<u64> {
        let function = self.function(id)?;
        function.address.ok_or_else(|| {
            InstrumentError::structural(format!("function {} has no address", function.name))
        })
    }

    /// Original bytes of a legal patch site
    fn site_bytes(&self, span: PatchSite) -> InstrumentResult<Vec<u8>> {
        let length = span.length as usize;
        if !(BRANCH_SIZE..=MAX_PATCH_BYTES).contains(&length) {
            return Err(InstrumentError::invalid_site(
                span.address,
                format!("patch length {} outside {}..={}", length, BRANCH_SIZE, MAX_PATCH_BYTES),
            ));
        }
        let section = self
            .image
            .section_containing(span.address)
            .ok_or_else(|| InstrumentError::invalid_site(span.address, "not inside any section"))?;
        if section.kind() != SectionKind::Code || !section.in_range(span.end() - 1) {
            return Err(InstrumentError::invalid_site(
                span.address,
                format!("{} bytes do not lie inside code section {}", length, section.name()),
            ));
        }
        self.image.read_bytes(span.address, length)
    }

    fn plan(&mut self) -> InstrumentResult<Plan> {
        let endian = self.image.endian();
        let table_vaddr = self
            .table_vaddr
            .ok_or_else(|| InstrumentError::structural("descriptor table was not laid out"))?;

        self.requests.sort_by_key(|r| r.span().address);
        self.requests.dedup();
        for pair in self.requests.windows(2) {
            let (a, b) = (pair[0].span(), pair[1].span());
            if a.overlaps(&b) {
                return Err(InstrumentError::invalid_site(
                    b.address,
                    format!("overlaps the site at 0x{:x}", a.address),
                ));
            }
        }

        let trampoline_base = self
            .image
            .next_free_address(self.config.page_size, CODE_ALIGN);
        let mut trampolines = Vec::new();
        let mut points = Vec::with_capacity(self.requests.len());

        for request in &self.requests {
            let span = request.span();
            let original = self.site_bytes(span)?;
            let point = match request {
                PatchRequest::Point { site, function, .. } => {
                    let at = trampoline_base + align_up(trampolines.len() as u64, CODE_ALIGN);
                    trampolines.resize((at - trampoline_base) as usize, PADDING);
                    let code = codegen::trampoline(
                        self.arch,
                        at,
                        span.address,
                        &original,
                        *site,
                        self.function_address(*function)?,
                    )?;
                    trampolines.extend_from_slice(&code);
                    let patch = codegen::site_patch(span.address, original.len(), at)?;
                    InstrumentationPoint::new(*site, span.address, original, patch)?
                }
                PatchRequest::Call {
                    site,
                    function,
                    address,
                    callee,
                } => {
                    if codegen::decode_call_target(*address, &original) != Some(*callee) {
                        return Err(InstrumentError::invalid_site(
                            *address,
                            format!("not a call to 0x{:x}", callee),
                        ));
                    }
                    let patch = codegen::call_rel32(*address, self.function_address(*function)?)?;
                    InstrumentationPoint::new(*site, *address, original, patch.to_vec())?
                }
            };
            points.push(point);
        }

        let mut new_entry = None;
        if let Some(hook) = self.entry_hook {
            let at = trampoline_base + align_up(trampolines.len() as u64, CODE_ALIGN);
            trampolines.resize((at - trampoline_base) as usize, PADDING);
            let code = codegen::entry_trampoline(
                self.arch,
                at,
                table_vaddr,
                self.function_address(hook)?,
                self.image.entry(),
            )?;
            trampolines.extend_from_slice(&code);
            new_entry = Some(at);
        }

        let mut exit_patch = None;
        if let Some(hook) = self.exit_hook {
            match self.exit_path()? {
                Some(address) => {
                    let at = trampoline_base + align_up(trampolines.len() as u64, CODE_ALIGN);
                    trampolines.resize((at - trampoline_base) as usize, PADDING);
                    let displaced = self.exit_site_bytes(address)?;
                    let code = codegen::hook_trampoline(
                        self.arch,
                        at,
                        address,
                        &displaced,
                        table_vaddr,
                        self.function_address(hook)?,
                    )?;
                    trampolines.extend_from_slice(&code);
                    exit_patch = Some((address, codegen::site_patch(address, displaced.len(), at)?));
                }
                None => warn!(
                    "no {} or {} to hook; exit routine is only recorded in the table",
                    FINI_SYMBOL, FINI_SECTION
                ),
            }
        }

        let site_ids_vaddr = align_up(trampoline_base + trampolines.len() as u64, 16);
        let mut site_ids = vec![0u8; self.site_ids.len() * 8];
        for (chunk, id) in site_ids.chunks_exact_mut(8).zip(&self.site_ids) {
            endian.write_uint(chunk, *id, 8);
        }

        let points_vaddr = align_up(site_ids_vaddr + site_ids.len() as u64, 16);
        let mut records = Vec::with_capacity(points.len() * POINT_RECORD.size);
        for point in &points {
            records.extend_from_slice(&point.encode(endian)?);
        }

        let exit_hook = match self.exit_hook {
            Some(id) => self.function_address(id)?,
            None => 0,
        };
        let header = TableHeader {
            point_count: points.len() as u32,
            site_count: self.site_ids.len() as u32,
            self_vaddr: table_vaddr,
            points_vaddr,
            site_ids_vaddr,
            original_entry: self.image.entry(),
            exit_hook,
            counters_vaddr: self.data.first().and_then(|d| d.address).unwrap_or(0),
        };

        Ok(Plan {
            trampolines,
            trampoline_base,
            site_ids,
            site_ids_vaddr,
            records,
            points_vaddr,
            points,
            header,
            new_entry,
            exit_patch,
        })
    }

    /// Start of the code the C runtime runs at exit
    fn exit_path(&self) -> InstrumentResult<Option<u64>> {
        if let Some(symbol) = self.image.find_symbol(FINI_SYMBOL)? {
            if symbol.is_function() && symbol.value() != 0 {
                return Ok(Some(symbol.value()));
            }
        }
        Ok(self
            .image
            .section_by_name(FINI_SECTION)
            .filter(|s| s.kind() == SectionKind::Code)
            .map(|s| s.header().addr()))
    }

    /// Whole instructions at `address` that make room for a jump, checked
    /// against every requested site
    fn exit_site_bytes(&self, address: u64) -> InstrumentResult<Vec<u8>> {
        let section = self
            .image
            .section_containing(address)
            .filter(|s| s.kind() == SectionKind::Code)
            .ok_or_else(|| InstrumentError::invalid_site(address, "exit routine is not in a code section"))?;
        let end = section.header().addr() + section.header().size();
        let available = (end - address).min(MAX_PATCH_BYTES as u64) as usize;
        let code = self.image.read_bytes(address, available)?;
        let length = codegen::instruction_span(self.arch, address, &code, BRANCH_SIZE)?;

        let span = PatchSite::new(address, length as u8);
        if let Some(request) = self.requests.iter().find(|r| r.span().overlaps(&span)) {
            return Err(InstrumentError::invalid_site(
                address,
                format!("exit hook overlaps the site at 0x{:x}", request.span().address),
            ));
        }
        Ok(code[..length].to_vec())
    }

    fn add_region(&mut self, suffix: &str, symbol: &str, addr: u64, flags: u64, kind: SymbolKind, bytes: Vec<u8>) -> InstrumentResult<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let size = bytes.len() as u64;
        let index = self.image.add_section(NewSection {
            name: self.config.section_name(suffix),
            sh_type: SHT_PROGBITS,
            flags,
            addr,
            align: 16,
            entsize: 0,
            link: 0,
            info: 0,
            contents: SectionContents::Bytes(bytes),
        })?;
        let name = self.unique_name(symbol)?;
        self.image.add_symbol(&name, kind, addr, size, index)?;
        Ok(())
    }

    fn commit(&mut self, plan: Plan) -> InstrumentResult<()> {
        let table_vaddr = plan.header.self_vaddr;
        let endian: Endian = self.image.endian();

        self.add_region(
            "tramp",
            "__inst_trampolines",
            plan.trampoline_base,
            alloc_flags(SHF_EXECINSTR),
            SymbolKind::Function,
            plan.trampolines,
        )?;
        self.add_region(
            "sites",
            "__inst_sites",
            plan.site_ids_vaddr,
            alloc_flags(0),
            SymbolKind::Object,
            plan.site_ids,
        )?;
        self.add_region(
            "points",
            "__inst_points",
            plan.points_vaddr,
            alloc_flags(SHF_WRITE),
            SymbolKind::Object,
            plan.records,
        )?;

        self.image
            .write_bytes(table_vaddr, &plan.header.encode(endian)?)?;
        for point in &plan.points {
            self.image.write_bytes(point.vaddr(), point.replacement())?;
            debug!(
                "patched {} bytes at 0x{:x} for site {}",
                point.len(),
                point.vaddr(),
                point.site()
            );
        }
        if let Some((address, patch)) = &plan.exit_patch {
            self.image.write_bytes(*address, patch)?;
            info!("exit routine at 0x{:x} hooked", address);
        }
        if let Some(entry) = plan.new_entry {
            info!("entry point 0x{:x} -> 0x{:x}", self.image.entry(), entry);
            self.image.set_entry(entry)?;
        }
        self.points = plan.points;
        Ok(())
    }

    // ---- output ----

    /// Serialize the instrumented image to bytes
    pub fn finish(&mut self) -> InstrumentResult<Vec<u8>> {
        self.expect_state(EngineState::Instrumented, "serialize")?;
        let bytes = writer::serialize(&mut self.image, &self.config)?;
        self.state = EngineState::Serialized;
        Ok(bytes)
    }

    /// Serialize and atomically replace `path`
    pub fn write(&mut self, path: &Path) -> InstrumentResult<()> {
        self.expect_state(EngineState::Instrumented, "write")?;
        writer::write_image(&mut self.image, &self.config, path)?;
        self.state = EngineState::Serialized;
        Ok(())
    }
}
