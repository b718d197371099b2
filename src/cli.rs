// ============================================================================
// LayerFE CLI — headless layer compositing via command-line arguments
// ============================================================================
//
// Usage examples:
//   layerfe -l base.png -l "shade.png:mode=multiply:opacity=0.6" -o out.png
//   layerfe -l bg.jpg -l "texture.png:clip" -l "glow/*.png:mode=screen" -o out.png
//   layerfe --open-project scene.lfe -l "stamp.png:hidden" --project scene2.lfe
//   layerfe -l a.png -l b.png --flatten -o merged.png          (keeps transparency)
//
// Each --layer is `PATH[:opacity=F][:mode=NAME][:clip][:hidden]`; the first
// layer given is the bottom of the stack.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;

use crate::blend::BlendMode;
use crate::canvas::ResampleFilter;
use crate::compositor::Compositor;
use crate::io::{load_layer, load_project, save_image, save_project};
use crate::layer::Layer;
use crate::layer_stack::LayerStack;
use crate::settings::CompositorSettings;

// ============================================================================
// CLI argument definition (clap Derive)
// ============================================================================

/// LayerFE headless layer compositor.
#[derive(Parser, Debug)]
#[command(
    name = "layerfe",
    about = "LayerFE headless layer compositor",
    long_about = "Stack image files as layers with opacity, blend modes and clipping\n\
                  masks, then write the composite or a .lfe layered project.\n\n\
                  Layer spec: PATH[:opacity=F][:mode=NAME][:clip][:hidden]\n\
                  Blend modes: normal, multiply, screen, overlay, darken, lighten,\n\
                  difference, addition, soft-light.\n\n\
                  Example:\n  \
                  layerfe -l base.png -l \"shade.png:mode=multiply:opacity=0.6\" -o out.png"
)]
pub struct CliArgs {
    /// Layer to stack, bottom first. Glob patterns accepted in PATH; every
    /// match gets the same options.
    #[arg(short, long = "layer", value_name = "SPEC", num_args = 1..)]
    pub layers: Vec<String>,

    /// Start from an existing .lfe project; --layer entries go on top.
    #[arg(long, value_name = "FILE.lfe")]
    pub open_project: Option<PathBuf>,

    /// Output image. The format is inferred from the extension.
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Write the output with real transparency instead of over the
    /// checkerboard.
    #[arg(long)]
    pub flatten: bool,

    /// Save the assembled stack as a .lfe project.
    #[arg(short, long, value_name = "FILE.lfe")]
    pub project: Option<PathBuf>,

    /// Checkerboard square size in pixels (overrides the settings file).
    #[arg(long, value_name = "PX")]
    pub checker_size: Option<u32>,

    /// Resampling filter for layers that differ from the canvas size:
    /// nearest, bilinear, bicubic, lanczos.
    #[arg(long, value_name = "FILTER")]
    pub filter: Option<String>,

    /// Settings file to read instead of the per-user default.
    #[arg(long, value_name = "FILE")]
    pub settings: Option<PathBuf>,

    /// Echo log lines to stderr and print timing information.
    #[arg(short, long)]
    pub verbose: bool,
}

/// One parsed `--layer` argument.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerSpec {
    pub pattern: String,
    pub opacity: Option<f32>,
    pub mode: Option<BlendMode>,
    pub clip: bool,
    pub hidden: bool,
}

impl LayerSpec {
    /// Parse `PATH[:opacity=F][:mode=NAME][:clip][:hidden]`.
    ///
    /// Options are peeled off the end, so a path that itself contains `:`
    /// (e.g. `C:\art\a.png`) survives as long as its last segment is not an
    /// option name.
    pub fn parse(spec: &str) -> Result<Self, String> {
        let mut parsed = LayerSpec {
            pattern: String::new(),
            opacity: None,
            mode: None,
            clip: false,
            hidden: false,
        };

        let mut rest = spec;
        while let Some((head, opt)) = rest.rsplit_once(':') {
            let opt_trim = opt.trim();
            if opt_trim.eq_ignore_ascii_case("clip") {
                parsed.clip = true;
            } else if opt_trim.eq_ignore_ascii_case("hidden") {
                parsed.hidden = true;
            } else if let Some(v) = opt_trim.strip_prefix("opacity=") {
                let value: f32 = v
                    .trim()
                    .parse()
                    .map_err(|_| format!("invalid opacity '{}' in layer '{}'", v, spec))?;
                if !(0.0..=1.0).contains(&value) {
                    return Err(format!("opacity {} out of range 0..1 in layer '{}'", value, spec));
                }
                parsed.opacity = Some(value);
            } else if let Some(v) = opt_trim.strip_prefix("mode=") {
                parsed.mode = Some(BlendMode::from_name(v));
            } else {
                break;
            }
            rest = head;
        }

        if rest.is_empty() {
            return Err(format!("layer '{}' has no path", spec));
        }
        parsed.pattern = rest.to_string();
        Ok(parsed)
    }

    /// Apply the per-layer options that live on the layer itself. Clipping
    /// is set through the stack, which knows the layer's position.
    fn apply(&self, mut layer: Layer) -> Layer {
        if let Some(opacity) = self.opacity {
            layer.set_opacity(opacity);
        }
        if let Some(mode) = self.mode {
            layer.set_blend_mode(mode);
        }
        layer.set_visible(!self.hidden);
        layer
    }
}

// ============================================================================
// Public entry point
// ============================================================================

/// Run the CLI and return an OS exit code.
/// `0` = every output written, `1` = anything failed.
pub fn run(args: CliArgs) -> ExitCode {
    match run_inner(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            crate::log_err!("{}", e);
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run_inner(args: &CliArgs) -> Result<(), String> {
    if args.output.is_none() && args.project.is_none() {
        return Err("nothing to do: give --output and/or --project".into());
    }
    if args.layers.is_empty() && args.open_project.is_none() {
        return Err("no layers: give at least one --layer or --open-project".into());
    }

    let settings = resolve_settings(args)?;
    let start = Instant::now();

    let mut stack = build_stack(args)?;
    stack.set_settings(settings.clone());
    if args.verbose {
        println!(
            "{} layers, canvas {}x{} ({:.0}ms)",
            stack.len(),
            stack.width(),
            stack.height(),
            start.elapsed().as_secs_f64() * 1000.0
        );
    }

    if let Some(out) = &args.output {
        let image = if args.flatten {
            Compositor::new(settings)
                .flatten_layers(stack.layers(), stack.width(), stack.height())
                .map_err(|e| format!("flatten failed: {}", e))?
        } else {
            let composite = stack
                .get_composite()
                .map_err(|e| format!("composite failed: {}", e))?;
            (*composite).clone()
        };
        save_image(&image, out).map_err(|e| format!("save failed: {}", e))?;
        if args.verbose {
            println!("  → {} ({:.0}ms)", out.display(), start.elapsed().as_secs_f64() * 1000.0);
        }
    }

    if let Some(project) = &args.project {
        save_project(&stack, project).map_err(|e| format!("project save failed: {}", e))?;
        if args.verbose {
            println!("  → {}", project.display());
        }
    }

    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

/// Settings file (explicit or per-user default) with CLI overrides applied.
fn resolve_settings(args: &CliArgs) -> Result<CompositorSettings, String> {
    let mut settings = match &args.settings {
        Some(path) => CompositorSettings::load_from(path),
        None => CompositorSettings::load(),
    };
    if let Some(size) = args.checker_size {
        if size == 0 {
            return Err("--checker-size must be at least 1".into());
        }
        settings.checker_size = size;
    }
    if let Some(name) = &args.filter {
        settings.resample_filter = ResampleFilter::from_name(name).ok_or_else(|| {
            let known: Vec<&str> = ResampleFilter::all().iter().map(|f| f.name()).collect();
            format!("unknown filter '{}' (expected one of: {})", name, known.join(", "))
        })?;
    }
    Ok(settings)
}

/// Load the optional project, then stack every `--layer` match on top.
fn build_stack(args: &CliArgs) -> Result<LayerStack, String> {
    let mut stack = match &args.open_project {
        Some(path) => Some(
            load_project(path)
                .map_err(|e| format!("could not open project '{}': {}", path.display(), e))?,
        ),
        None => None,
    };

    for raw in &args.layers {
        let spec = LayerSpec::parse(raw)?;
        let paths = resolve_inputs(std::slice::from_ref(&spec.pattern));
        if paths.is_empty() {
            return Err(format!("layer '{}' matched no files", spec.pattern));
        }

        for path in paths {
            let layer = load_layer(&path)
                .map_err(|e| format!("load failed for '{}': {}", path.display(), e))?;
            let layer = spec.apply(layer);

            let index = match stack.as_mut() {
                Some(s) => s.insert(layer, s.len()),
                None => {
                    stack = Some(LayerStack::from_layers(vec![layer]).map_err(|e| e.to_string())?);
                    0
                }
            };
            if spec.clip
                && let Some(s) = stack.as_mut()
            {
                s.set_clipping_mask(index, true)
                    .map_err(|e| format!("'{}': {}", path.display(), e))?;
            }
        }
    }

    stack.ok_or_else(|| "no layers loaded".to_string())
}

/// Expand glob patterns and literal paths into a deduplicated, ordered list.
fn resolve_inputs(patterns: &[String]) -> Vec<PathBuf> {
    let mut result: Vec<PathBuf> = Vec::new();

    for pattern in patterns {
        let as_path = Path::new(pattern);

        if as_path.exists() {
            // Literal path — use directly
            if !result.iter().any(|p| p.as_path() == as_path) {
                result.push(as_path.to_path_buf());
            }
            continue;
        }

        match glob::glob(pattern) {
            Ok(entries) => {
                let mut matched = false;
                for entry in entries.flatten() {
                    if !result.contains(&entry) {
                        result.push(entry);
                    }
                    matched = true;
                }
                if !matched {
                    crate::log_warn!("Pattern '{}' matched no files", pattern);
                }
            }
            Err(e) => {
                crate::log_warn!("Invalid glob '{}': {}", pattern, e);
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::PixelBuffer;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("layerfe_cli_{}_{}", name, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_png(path: &Path, color: [u8; 4]) {
        let buf = PixelBuffer::new_filled(2, 2, color).unwrap();
        save_image(&buf, path).unwrap();
    }

    fn args(list: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(std::iter::once("layerfe").chain(list.iter().copied())).unwrap()
    }

    #[test]
    fn plain_path_has_no_options() {
        let spec = LayerSpec::parse("art/base.png").unwrap();
        assert_eq!(spec.pattern, "art/base.png");
        assert_eq!(spec.opacity, None);
        assert_eq!(spec.mode, None);
        assert!(!spec.clip && !spec.hidden);
    }

    #[test]
    fn options_are_peeled_from_the_end() {
        let spec = LayerSpec::parse("C:\\art\\shade.png:mode=Soft Light:opacity=0.4:clip:hidden").unwrap();
        assert_eq!(spec.pattern, "C:\\art\\shade.png");
        assert_eq!(spec.opacity, Some(0.4));
        assert_eq!(spec.mode, Some(BlendMode::SoftLight));
        assert!(spec.clip && spec.hidden);
    }

    #[test]
    fn unknown_mode_falls_back_to_normal() {
        let spec = LayerSpec::parse("a.png:mode=vivid-light").unwrap();
        assert_eq!(spec.mode, Some(BlendMode::Normal));
    }

    #[test]
    fn bad_specs_are_rejected() {
        assert!(LayerSpec::parse("a.png:opacity=lots").is_err());
        assert!(LayerSpec::parse("a.png:opacity=1.5").is_err());
        assert!(LayerSpec::parse(":clip").is_err());
    }

    #[test]
    fn resolve_inputs_dedups_literals_and_globs() {
        let dir = temp_dir("glob");
        let a = dir.join("a.png");
        let b = dir.join("b.png");
        write_png(&a, [0, 0, 255, 255]);
        write_png(&b, [255, 0, 0, 255]);

        let glob = format!("{}/*.png", dir.display());
        let found = resolve_inputs(&[a.display().to_string(), glob]);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0], a);
        assert!(found.contains(&b));
        assert!(resolve_inputs(&[format!("{}/*.nothing", dir.display())]).is_empty());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn composites_layers_to_output_and_project() {
        let dir = temp_dir("run");
        let red = dir.join("red.png");
        let blue = dir.join("blue.png");
        write_png(&red, [0, 0, 255, 255]);
        write_png(&blue, [255, 0, 0, 255]);
        let out = dir.join("out.png");
        let project = dir.join("scene.lfe");
        let blue_spec = format!("{}:opacity=0.5", blue.display());

        run_inner(&args(&[
            "-l", &red.display().to_string(),
            "-l", &blue_spec,
            "-o", &out.display().to_string(),
            "--project", &project.display().to_string(),
            "--settings", &dir.join("none.cfg").display().to_string(),
        ]))
        .unwrap();

        let [b, g, r, a] = crate::io::load_image(&out).unwrap().pixel(0, 0);
        assert!(b.abs_diff(128) <= 1 && r.abs_diff(128) <= 1);
        assert_eq!((g, a), (0, 255));

        let stack = load_project(&project).unwrap();
        assert_eq!(stack.len(), 2);
        assert_eq!(stack.layer(1).unwrap().opacity(), 0.5);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn clip_on_first_layer_fails() {
        let dir = temp_dir("clip");
        let red = dir.join("red.png");
        write_png(&red, [0, 0, 255, 255]);
        let spec = format!("{}:clip", red.display());
        let parsed = args(&["-l", &spec, "-o", &dir.join("o.png").display().to_string()]);
        let err = build_stack(&parsed).unwrap_err();
        assert!(err.contains("bottom layer"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_outputs_are_rejected() {
        assert!(run_inner(&args(&["-l", "a.png"])).is_err());
        assert!(run_inner(&args(&["-o", "out.png"])).is_err());
        assert!(CliArgs::try_parse_from(["layerfe", "--checker-size", "x"]).is_err());
    }

    #[test]
    fn settings_overrides_apply() {
        let parsed = args(&["--checker-size", "8", "--filter", "nearest", "--settings", "/nonexistent/x.cfg"]);
        let settings = resolve_settings(&parsed).unwrap();
        assert_eq!(settings.checker_size, 8);
        assert_eq!(settings.resample_filter, ResampleFilter::Nearest);
        assert!(resolve_settings(&args(&["--filter", "box", "--settings", "/nonexistent/x.cfg"])).is_err());
    }
}
