//! Emission of the four result artifacts: tree JSON, the aggregate data
//! file, per-pair id/name/symbol lists, and the HTML skeleton.
//!
//! Every artifact is written to a temporary path inside the output
//! directory and renamed into place on success, so a failed run never
//! clobbers a previous one's output.

use crate::aggregate::SiteScalars;
use crate::error::GrandConvError;
use crate::pairs::BranchPair;
use crate::regression::RegressionResult;
use crate::tree::Tree;
use std::fs;
use std::path::{Path, PathBuf};

/// The fixed path layout: artifacts land under `$output/UI/User/`.
pub struct ResultSink {
    user_dir: PathBuf,
}

const HTML_TEMPLATE_NAMES: [&str; 5] = [
    "index.html",
    "tree_view.html",
    "scatter.html",
    "rate_vs_divergence.html",
    "per_pair.html",
];

impl ResultSink {
    /// Creates the sink rooted at `output_dir/UI/User`, creating the
    /// directory tree if needed.
    pub fn new(output_dir: &Path) -> Result<Self, GrandConvError> {
        let user_dir = output_dir.join("UI").join("User");
        fs::create_dir_all(&user_dir)?;
        Ok(Self { user_dir })
    }

    fn write_atomically(&self, file_name: &str, contents: &str) -> Result<(), GrandConvError> {
        let tmp_path = self.user_dir.join(format!("{file_name}.tmp"));
        let final_path = self.user_dir.join(file_name);
        fs::write(&tmp_path, contents)?;
        fs::rename(&tmp_path, &final_path)?;
        Ok(())
    }

    /// Emits `tree.json`: node id, parent, branch length, name, children.
    pub fn write_tree(&self, tree: &Tree) -> Result<(), GrandConvError> {
        let json = serde_json::to_string_pretty(tree)?;
        self.write_atomically("tree.json", &json)
    }

    /// Emits the aggregate scatter/per-site data file and the per-pair
    /// id/name/symbol lists (components 2 and 3 of the external
    /// contract), built with append-style string construction and
    /// fixed six-decimal precision for every scalar except the
    /// regression coefficients.
    pub fn write_data(
        &self,
        tree: &Tree,
        pairs: &[BranchPair],
        scalars: &SiteScalars,
        regression: &RegressionResult,
        num_sites: usize,
    ) -> Result<(), GrandConvError> {
        let num_selected = pairs.iter().filter(|p| p.selected).count();

        // Reserve up front using an exact-size estimate (label length
        // dominated by node names) rather than growing by repeated
        // self-overlapping concatenation.
        let estimated_capacity = 256 + pairs.len() * 96
            + scalars
                .per_site
                .iter()
                .map(|t| t.rows.len() * 32)
                .sum::<usize>();
        let mut buf = String::with_capacity(estimated_capacity);

        buf.push_str("{\n");
        buf.push_str(&format!("  \"regressionSlope\": {},\n", regression.k));
        buf.push_str(&format!("  \"regressionIntercept\": {},\n", regression.b));
        buf.push_str(&format!(
            "  \"numOfSelectedBranchPairs\": {num_selected},\n"
        ));
        buf.push_str(&format!("  \"numOfSites\": {num_sites},\n"));

        push_float_array(&mut buf, "xPoints", &scalars.p_divergent);
        buf.push_str(",\n");
        push_float_array(&mut buf, "yPoints", &scalars.p_convergent);
        buf.push_str(",\n");

        buf.push_str("  \"labels\": [\n");
        for (i, pair) in pairs.iter().enumerate() {
            let label = format!(
                "f({})..{} x f({})..{}",
                label_for_node(tree, pair.u),
                pair.u,
                label_for_node(tree, pair.v),
                pair.v
            );
            buf.push_str("    ");
            buf.push_str(&serde_json::to_string(&label)?);
            if i + 1 != pairs.len() {
                buf.push(',');
            }
            buf.push('\n');
        }
        buf.push_str("  ],\n");

        // xPostNumSub/ySiteClass have no documented definition beyond
        // their names; mirrored from xPoints/yPoints as a placeholder so
        // the keys are always present with well-formed data.
        push_float_array(&mut buf, "xPostNumSub", &scalars.p_divergent);
        buf.push_str(",\n");
        push_float_array(&mut buf, "ySiteClass", &scalars.p_convergent);
        buf.push_str(",\n");

        buf.push_str("  \"perPairSiteData\": [\n");
        for (i, table) in scalars.per_site.iter().enumerate() {
            buf.push_str("    [\n");
            for (site_idx, &(conv, div)) in table.rows.iter().enumerate() {
                buf.push_str(&format!(
                    "      [{site_idx}, {conv:.6}, {div:.6}]"
                ));
                if site_idx + 1 != table.rows.len() {
                    buf.push(',');
                }
                buf.push('\n');
            }
            buf.push_str("    ]");
            if i + 1 != scalars.per_site.len() {
                buf.push(',');
            }
            buf.push('\n');
        }
        buf.push_str("  ]\n");
        buf.push_str("}\n");

        self.write_atomically("data.json", &buf)?;
        self.write_pair_identifiers(pairs)?;
        Ok(())
    }

    fn write_pair_identifiers(&self, pairs: &[BranchPair]) -> Result<(), GrandConvError> {
        let mut buf = String::with_capacity(128 + pairs.len() * 64);
        buf.push_str("{\n  \"siteSpecificBranchPairsIDs\": [\n");
        let selected: Vec<&BranchPair> = pairs.iter().filter(|p| p.selected).collect();
        for (i, pair) in selected.iter().enumerate() {
            buf.push_str(&format!("    \"BP_{}x{}\"", pair.u, pair.v));
            if i + 1 != selected.len() {
                buf.push(',');
            }
            buf.push('\n');
        }
        buf.push_str("  ],\n  \"names\": [\n");
        for (i, pair) in selected.iter().enumerate() {
            buf.push_str(&format!(
                "    \"Branch Pair: {}..{}\"",
                pair.u, pair.v
            ));
            if i + 1 != selected.len() {
                buf.push(',');
            }
            buf.push('\n');
        }
        buf.push_str("  ],\n  \"symbols\": [\n");
        for (i, pair) in selected.iter().enumerate() {
            buf.push_str(&format!("    \"BP_{}x{}\"", pair.u, pair.v));
            if i + 1 != selected.len() {
                buf.push(',');
            }
            buf.push('\n');
        }
        buf.push_str("  ]\n}\n");
        self.write_atomically("pair_ids.json", &buf)
    }

    /// Renders the five HTML artifacts from the bundled templates,
    /// substituting marker lines for generated content. A marker that
    /// does not appear in a given template is a no-op, matching
    /// observed upstream behavior for variants without that marker.
    pub fn write_html(
        &self,
        pairs: &[BranchPair],
        num_sites: usize,
    ) -> Result<(), GrandConvError> {
        let data_tag = "<script src=\"data.json\"></script>".to_string();
        let table_and_plot = if pairs.is_empty() {
            "<p class=\"placeholder\">No branch pairs were enumerated for this run.</p>"
                .to_string()
        } else {
            format!(
                "<p>{} branch pairs, {} sites.</p>",
                pairs.len(),
                num_sites
            )
        };
        let rate_vs_div_plot = "<div id=\"rate-vs-div-plot\"></div>".to_string();
        let plot = if pairs.iter().any(|p| p.selected) {
            "<div id=\"plot\"></div>".to_string()
        } else {
            "<p class=\"placeholder\">No branch pairs were selected for per-site output.</p>"
                .to_string()
        };

        for name in HTML_TEMPLATE_NAMES {
            let template = bundled_template(name);
            let rendered = substitute_markers(
                template,
                &[
                    ("@dataTag", &data_tag),
                    ("@tableAndPlot", &table_and_plot),
                    ("@rateVsDivPlot", &rate_vs_div_plot),
                    ("@plot", &plot),
                ],
            );
            self.write_atomically(name, &rendered)?;
        }
        Ok(())
    }
}

fn push_float_array(buf: &mut String, name: &str, values: &[f64]) {
    buf.push_str(&format!("  \"{name}\": ["));
    for (i, v) in values.iter().enumerate() {
        buf.push_str(&format!("{v:.6}"));
        if i + 1 != values.len() {
            buf.push_str(", ");
        }
    }
    buf.push(']');
}

fn label_for_node(tree: &Tree, id: crate::ids::NodeId) -> String {
    tree.node(id)
        .and_then(|n| n.name.clone())
        .unwrap_or_else(|| id.to_string())
}

fn bundled_template(name: &str) -> &'static str {
    match name {
        "index.html" => include_str!("../templates/index.html"),
        "tree_view.html" => include_str!("../templates/tree_view.html"),
        "scatter.html" => include_str!("../templates/scatter.html"),
        "rate_vs_divergence.html" => include_str!("../templates/rate_vs_divergence.html"),
        "per_pair.html" => include_str!("../templates/per_pair.html"),
        _ => unreachable!("unknown template {name}"),
    }
}

/// Replaces any line whose trimmed content exactly equals one of
/// `markers`' keys with the corresponding value; other lines pass
/// through unchanged. A marker absent from `template` contributes
/// nothing (no-op), matching the documented template-variant behavior.
fn substitute_markers(template: &str, markers: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len() + 256);
    for line in template.lines() {
        let trimmed = line.trim();
        if let Some((_, replacement)) = markers.iter().find(|(marker, _)| *marker == trimmed) {
            out.push_str(replacement);
        } else {
            out.push_str(line);
        }
        out.push('\n');
    }
    out
}
