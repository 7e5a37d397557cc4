//! Codec registry: maps a configured protocol name to its codec factory.
//!
//! Consulted once at startup; a listener process runs exactly one protocol.
//! Handler names may carry a firmware suffix (`globalsat.tr-600`,
//! `naviset.gt20`); the family is the part before the first dot.

use crate::codec::{Codec, CodecConfig};
use crate::error::{CodecError, Result};

type Factory = fn(&CodecConfig) -> Result<Box<dyn Codec>>;

/// Startup list of `(family, factory)` pairs.
pub struct Registry {
    entries: Vec<(&'static str, Factory)>,
}

impl Registry {
    /// Registry with every supported firmware family.
    pub fn standard() -> Self {
        Self {
            entries: vec![
                ("globalsat", |c| Ok(Box::new(crate::globalsat::GlobalsatCodec::new(c)?))),
                ("naviset", |c| Ok(Box::new(crate::naviset::NavisetCodec::new(c)))),
                ("teltonika", |c| Ok(Box::new(crate::teltonika::TeltonikaCodec::new(c)))),
                ("autolink", |c| Ok(Box::new(crate::autolink::AutolinkCodec::new(c)))),
                ("atrack", |c| Ok(Box::new(crate::atrack::AtrackCodec::new(c)))),
                ("galileo", |c| Ok(Box::new(crate::galileo::GalileoCodec::new(c)))),
                ("ime", |c| Ok(Box::new(crate::ime::ImeCodec::new(c)))),
            ],
        }
    }

    /// Protocol families known to this registry.
    pub fn aliases(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.iter().map(|(alias, _)| *alias)
    }

    /// Instantiate a codec for a handler name. Unknown names are a fatal
    /// configuration error at startup.
    pub fn create(&self, handler: &str, config: &CodecConfig) -> Result<Box<dyn Codec>> {
        let family = handler.split('.').next().unwrap_or(handler);
        let factory = self
            .entries
            .iter()
            .find(|(alias, _)| *alias == family)
            .map(|(_, factory)| factory)
            .ok_or_else(|| CodecError::Config(format!("unknown protocol handler: {handler}")))?;
        factory(config)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_families() {
        let registry = Registry::standard();
        let config = CodecConfig::default();
        for handler in ["naviset.gt20", "teltonika.fmxxxx", "galileo", "ime", "autolink", "atrack.ax5"] {
            assert!(registry.create(handler, &config).is_ok(), "{handler}");
        }
    }

    #[test]
    fn test_unknown_family_is_config_error() {
        let registry = Registry::standard();
        let err = registry.create("wialon", &CodecConfig::default()).unwrap_err();
        assert!(matches!(err, CodecError::Config(_)));
    }
}
