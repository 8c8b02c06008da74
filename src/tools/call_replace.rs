//! Redirects calls to listed functions through injected wrappers.
//!
//! Each argument line is `<function> [<wrapper>]`. The wrapper defaults to
//! `<function>_wrapper` and forwards to the original function unless a body
//! is configured for it.

use tracing::{debug, warn};

use crate::engine::{FunctionBody, FunctionId, Instrumenter};
use crate::error::{InstrumentError, InstrumentResult};
use crate::sites::SiteInventory;
use crate::tools::{ArgCardinality, InstrumentationTool, ToolInfo};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplaceTarget {
    pub function: String,
    pub wrapper: String,
}

#[derive(Debug, Clone, Copy)]
struct Resolved {
    original: u64,
    wrapper: FunctionId,
}

pub struct CallReplace {
    inventory: SiteInventory,
    targets: Vec<ReplaceTarget>,
    resolved: Vec<Option<Resolved>>,
}

impl CallReplace {
    pub const NAME: &'static str = "CallReplace";

    pub const INFO: ToolInfo = ToolInfo {
        name: Self::NAME,
        extension: "crinst",
        args: ArgCardinality::Required,
        description: "redirect calls to the listed functions through wrappers",
    };

    pub fn new(inventory: SiteInventory, targets: Vec<ReplaceTarget>) -> Self {
        Self {
            inventory,
            targets,
            resolved: Vec::new(),
        }
    }

    pub fn from_lines(inventory: SiteInventory, lines: &[String]) -> InstrumentResult<Self> {
        let mut targets: Vec<ReplaceTarget> = Vec::with_capacity(lines.len());
        for line in lines {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let target = match fields.as_slice() {
                [function] => ReplaceTarget {
                    function: function.to_string(),
                    wrapper: format!("{}_wrapper", function),
                },
                [function, wrapper] => ReplaceTarget {
                    function: function.to_string(),
                    wrapper: wrapper.to_string(),
                },
                _ => {
                    return Err(InstrumentError::Config(format!(
                        "expected '<function> [<wrapper>]', got '{}'",
                        line
                    )))
                }
            };
            if targets.iter().any(|t| t.function == target.function) {
                warn!("{} listed twice, keeping the first entry", target.function);
                continue;
            }
            targets.push(target);
        }
        Ok(Self::new(inventory, targets))
    }

    pub fn targets(&self) -> &[ReplaceTarget] {
        &self.targets
    }
}

impl InstrumentationTool for CallReplace {
    fn info(&self) -> ToolInfo {
        Self::INFO
    }

    fn declare(&mut self, engine: &mut Instrumenter) -> InstrumentResult<()> {
        self.resolved.clear();
        for target in &self.targets {
            let symbol = engine
                .image()
                .find_symbol(&target.function)?
                .filter(|s| s.is_function());
            let resolved = match symbol {
                Some(symbol) => {
                    let wrapper = engine.declare_function(
                        &target.wrapper,
                        FunctionBody::Forward {
                            target: symbol.value(),
                        },
                    )?;
                    Some(Resolved {
                        original: symbol.value(),
                        wrapper,
                    })
                }
                None => {
                    warn!("{} is not a function defined in the image, skipped", target.function);
                    None
                }
            };
            self.resolved.push(resolved);
        }

        let entry = engine.declare_function("callreplace_program_entry", FunctionBody::Stub)?;
        let exit = engine.declare_function("callreplace_program_exit", FunctionBody::Stub)?;
        engine.set_entry_hook(entry)?;
        engine.set_exit_hook(exit)?;
        Ok(())
    }

    fn instrument(&mut self, engine: &mut Instrumenter) -> InstrumentResult<()> {
        if self.resolved.len() != self.targets.len() {
            return Err(InstrumentError::structural("CallReplace was not declared"));
        }
        for (target, resolved) in self.targets.iter().zip(&self.resolved) {
            let Some(resolved) = resolved else { continue };
            let site = engine.add_site(resolved.original)?;
            let calls = self
                .inventory
                .call_sites
                .iter()
                .filter(|c| c.callee == target.function);
            let mut count = 0;
            for call in calls {
                engine.redirect_call(site, resolved.wrapper, call.address, resolved.original)?;
                count += 1;
            }
            debug!("{}: {} call sites redirected to {}", target.function, count, target.wrapper);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen;
    use crate::config::RewriteConfig;
    use crate::descriptor::PatchTarget;
    use crate::fixtures;
    use crate::image::ElfImage;
    use crate::structure::Width;

    fn lines(text: &[&str]) -> Vec<String> {
        text.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_targets() {
        let tool = CallReplace::from_lines(
            SiteInventory::default(),
            &lines(&["malloc", "free my_free", "malloc"]),
        )
        .unwrap();
        assert_eq!(tool.targets().len(), 2);
        assert_eq!(tool.targets()[0].wrapper, "malloc_wrapper");
        assert_eq!(tool.targets()[1].wrapper, "my_free");

        assert!(CallReplace::from_lines(SiteInventory::default(), &lines(&["a b c"])).is_err());
    }

    #[test]
    fn test_calls_redirected_to_wrapper() {
        for width in [Width::Elf32, Width::Elf64] {
            let text = fixtures::text_addr(width);
            let image = ElfImage::from_bytes(fixtures::sample_elf(width)).unwrap();
            let mut engine = Instrumenter::new(image, RewriteConfig::default()).unwrap();
            let mut tool =
                CallReplace::from_lines(fixtures::sample_inventory(width), &lines(&["helper", "missing"]))
                    .unwrap();

            engine.declare(&mut tool).unwrap();
            engine.instrument(&mut tool).unwrap();

            let wrapper = engine.image().find_symbol("helper_wrapper").unwrap().unwrap();
            assert!(engine.image().find_symbol("missing_wrapper").unwrap().is_none());

            let points = engine.points();
            assert_eq!(points.len(), 1);
            assert_eq!(points[0].vaddr(), text + 0x18);
            let call = engine.image().read_bytes(text + 0x18, 5).unwrap();
            assert_eq!(codegen::decode_call_target(text + 0x18, &call), Some(wrapper.value()));
            assert_eq!(engine.site_ids(), &[text + 0x20]);

            let entry = engine.image().find_symbol("callreplace_program_entry").unwrap().unwrap();
            assert_ne!(engine.image().entry(), text);
            assert_ne!(engine.image().entry(), entry.value());
        }
    }
}
