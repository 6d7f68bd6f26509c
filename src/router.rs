//! Format graph and route planning.
//!
//! Routes are resolved over a static adjacency table of direct transitions.
//! When no direct edge exists the router tries PNG as a hub, then SVG, and
//! never chains more than one hub.

use crate::error::ConvertError;
use crate::format::Format;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Hub formats in preference order.
const HUBS: [Format; 2] = [Format::Png, Format::Svg];

/// Directly supported transitions of the default graph.
const DEFAULT_EDGES: &[(Format, Format)] = &[
    (Format::Svg, Format::Png),
    (Format::Svg, Format::Jpeg),
    (Format::Svg, Format::Webp),
    (Format::Png, Format::Svg),
    (Format::Png, Format::Jpeg),
    (Format::Png, Format::Webp),
    (Format::Png, Format::Gif),
    (Format::Jpeg, Format::Png),
    (Format::Jpeg, Format::Svg),
    (Format::Webp, Format::Png),
    (Format::Gif, Format::Png),
];

/// An ordered path of formats from source to target.
///
/// Always two or three formats long, with every adjacent pair a direct
/// transition of the graph that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionRoute(Vec<Format>);

impl ConversionRoute {
    pub fn formats(&self) -> &[Format] {
        &self.0
    }

    pub fn source(&self) -> Format {
        self.0[0]
    }

    pub fn target(&self) -> Format {
        self.0[self.0.len() - 1]
    }

    pub fn hops(&self) -> impl Iterator<Item = (Format, Format)> + '_ {
        self.0.windows(2).map(|pair| (pair[0], pair[1]))
    }

    pub fn hop_count(&self) -> usize {
        self.0.len() - 1
    }

    pub fn is_direct(&self) -> bool {
        self.0.len() == 2
    }
}

impl fmt::Display for ConversionRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, format) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" -> ")?;
            }
            write!(f, "{}", format)?;
        }
        Ok(())
    }
}

/// Adjacency table of directly supported format transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatGraph {
    edges: BTreeSet<(Format, Format)>,
}

impl FormatGraph {
    /// Builds a graph from explicit edges. Self loops are ignored.
    pub fn new(edges: impl IntoIterator<Item = (Format, Format)>) -> Self {
        Self {
            edges: edges.into_iter().filter(|(from, to)| from != to).collect(),
        }
    }

    pub fn has_edge(&self, from: Format, to: Format) -> bool {
        self.edges.contains(&(from, to))
    }

    /// A format is supported when it appears in at least one edge.
    pub fn supports(&self, format: Format) -> bool {
        self.edges
            .iter()
            .any(|&(from, to)| from == format || to == format)
    }

    pub fn edges(&self) -> impl Iterator<Item = (Format, Format)> + '_ {
        self.edges.iter().copied()
    }

    /// Resolves the conversion path for `from` -> `to`.
    ///
    /// Priority: direct edge, then `[from, PNG, to]`, then `[from, SVG, to]`.
    pub fn route(&self, from: Format, to: Format) -> Result<ConversionRoute, ConvertError> {
        for format in [from, to] {
            if !self.supports(format) {
                return Err(ConvertError::UnsupportedFormat(format.to_string()));
            }
        }
        if from == to {
            return Err(ConvertError::InvalidOptions(format!(
                "source and target format are both {}",
                from
            )));
        }

        if self.has_edge(from, to) {
            return Ok(ConversionRoute(vec![from, to]));
        }

        HUBS.iter()
            .copied()
            .filter(|&hub| hub != from && hub != to)
            .find(|&hub| self.has_edge(from, hub) && self.has_edge(hub, to))
            .map(|hub| ConversionRoute(vec![from, hub, to]))
            .ok_or(ConvertError::UnsupportedRoute { from, to })
    }
}

impl Default for FormatGraph {
    fn default() -> Self {
        Self::new(DEFAULT_EDGES.iter().copied())
    }
}
