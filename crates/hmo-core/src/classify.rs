use std::collections::HashMap;
use std::path::Path;
use std::process::Command;
use std::str::FromStr;

use anyhow::{bail, Context};
use log::{debug, warn};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::manifest::{Manifest, TagMap};

/// One detection as printed by a detector: an arbitrary JSON object.
pub type Detection = Map<String, Value>;

const DEEPFACE_BACKENDS: &[&str] = &[
    "opencv",
    "retinaface",
    "mtcnn",
    "ssd",
    "dlib",
    "mediapipe",
    "yolov8",
    "yolov11n",
    "yolov11s",
    "yolov11m",
    "centerface",
    "skip",
];

const NUDENET_LABELS: &[&str] = &[
    "FEMALE_GENITALIA_COVERED",
    "FACE_FEMALE",
    "BUTTOCKS_EXPOSED",
    "FEMALE_BREAST_EXPOSED",
    "FEMALE_GENITALIA_EXPOSED",
    "MALE_BREAST_EXPOSED",
    "ANUS_EXPOSED",
    "FEET_EXPOSED",
    "BELLY_COVERED",
    "FEET_COVERED",
    "ARMPITS_COVERED",
    "ARMPITS_EXPOSED",
    "FACE_MALE",
    "BELLY_EXPOSED",
    "MALE_GENITALIA_EXPOSED",
    "ANUS_COVERED",
    "FEMALE_BREAST_COVERED",
    "BUTTOCKS_COVERED",
];

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("unknown classifier {0:?}, choose from nudenet, age, gender, race, emotion")]
    UnknownModel(String),
    #[error("{model} does not support backend model {backend}. Please choose from {}", .allowed.join(", "))]
    UnsupportedBackend {
        model: &'static str,
        backend: String,
        allowed: &'static [&'static str],
    },
    #[error("{model} does not support tag: {tag}")]
    UnsupportedTag { model: &'static str, tag: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Model {
    NudeNet,
    Age,
    Gender,
    Race,
    Emotion,
}

impl Model {
    pub fn name(self) -> &'static str {
        match self {
            Model::NudeNet => "nudenet",
            Model::Age => "age",
            Model::Gender => "gender",
            Model::Race => "race",
            Model::Emotion => "emotion",
        }
    }

    /// Tags this model can produce.
    pub fn labels(self) -> &'static [&'static str] {
        match self {
            Model::NudeNet => NUDENET_LABELS,
            Model::Age => &["baby", "toddler", "teenager", "adult", "elderly"],
            Model::Gender => &["Woman", "Man"],
            Model::Race => &[
                "asian",
                "indian",
                "black",
                "white",
                "middle eastern",
                "latino hispanic",
            ],
            Model::Emotion => &["angry", "disgust", "fear", "happy", "sad", "surprise", "neutral"],
        }
    }

    pub fn backends(self) -> &'static [&'static str] {
        match self {
            Model::NudeNet => &["nudenet"],
            _ => DEEPFACE_BACKENDS,
        }
    }

    pub fn default_backend(self) -> &'static str {
        match self {
            Model::NudeNet => "",
            _ => "opencv",
        }
    }

    /// Key holding the winning label in a face-analysis detection.
    fn dominant_key(self) -> Option<(&'static str, &'static str)> {
        match self {
            Model::Gender => Some(("dominant_gender", "gender")),
            Model::Race => Some(("dominant_race", "race")),
            Model::Emotion => Some(("dominant_emotion", "emotion")),
            Model::NudeNet | Model::Age => None,
        }
    }
}

impl FromStr for Model {
    type Err = ClassifyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "nudenet" => Model::NudeNet,
            "age" => Model::Age,
            "gender" => Model::Gender,
            "race" => Model::Race,
            "emotion" => Model::Emotion,
            _ => return Err(ClassifyError::UnknownModel(s.to_string())),
        })
    }
}

/// A model with the detector backend to run it with, e.g. `age:retinaface`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifierSpec {
    pub model: Model,
    pub backend: String,
}

impl FromStr for ClassifierSpec {
    type Err = ClassifyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, backend) = match s.split_once(':') {
            Some((n, b)) => (n, Some(b)),
            None => (s, None),
        };
        let model: Model = name.parse()?;
        let backend = match backend {
            Some(b) if model.backends().contains(&b) => b.to_string(),
            Some(b) => {
                return Err(ClassifyError::UnsupportedBackend {
                    model: model.name(),
                    backend: b.to_string(),
                    allowed: model.backends(),
                })
            }
            None => model.default_backend().to_string(),
        };
        Ok(Self { model, backend })
    }
}

pub fn age_label(age: f64) -> &'static str {
    if age < 3.0 {
        "baby"
    } else if age < 12.0 {
        "toddler"
    } else if age < 20.0 {
        "teenager"
    } else if age < 60.0 {
        "adult"
    } else {
        "elderly"
    }
}

/// Runs a model on one file.
pub trait Detector: Send + Sync {
    fn detect(&self, spec: &ClassifierSpec, path: &Path) -> anyhow::Result<Vec<Detection>>;
}

/// Detector that runs a configured external program per model.
///
/// The argument list may contain `{file}`, `{backend}` and `{model}`
/// placeholders. The program prints a JSON array of detections (a single
/// object is accepted too).
#[derive(Debug, Clone, Default)]
pub struct CommandDetector {
    commands: HashMap<String, Vec<String>>,
}

impl CommandDetector {
    pub fn new(commands: HashMap<String, Vec<String>>) -> Self {
        Self { commands }
    }

    pub fn has_command(&self, model: Model) -> bool {
        self.commands
            .get(model.name())
            .is_some_and(|argv| !argv.is_empty())
    }
}

impl Detector for CommandDetector {
    fn detect(&self, spec: &ClassifierSpec, path: &Path) -> anyhow::Result<Vec<Detection>> {
        let name = spec.model.name();
        let Some((program, args)) = self.commands.get(name).and_then(|a| a.split_first()) else {
            bail!("no command configured for classifier {}", name);
        };
        let file = path.to_string_lossy();
        let expand = |arg: &String| {
            arg.replace("{file}", &file)
                .replace("{backend}", &spec.backend)
                .replace("{model}", name)
        };

        let output = Command::new(expand(program))
            .args(args.iter().map(expand))
            .output()
            .with_context(|| format!("failed to run {} classifier", name))?;
        if !output.status.success() {
            bail!(
                "{} classifier failed on {}: {}",
                name,
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let parsed: Value = serde_json::from_slice(&output.stdout)
            .with_context(|| format!("unexpected {} classifier output", name))?;
        Ok(match parsed {
            Value::Array(items) => items
                .into_iter()
                .filter_map(|v| match v {
                    Value::Object(m) => Some(m),
                    _ => None,
                })
                .collect(),
            Value::Object(m) => vec![m],
            _ => Vec::new(),
        })
    }
}

/// A configured model: which tags to accept and how confident it must be.
#[derive(Debug, Clone)]
pub struct Classifier {
    spec: ClassifierSpec,
    threshold: Option<f64>,
    tags: Option<Vec<String>>,
}

impl Classifier {
    pub fn new(
        spec: ClassifierSpec,
        threshold: Option<f64>,
        tags: Option<Vec<String>>,
    ) -> Result<Self, ClassifyError> {
        for tag in tags.iter().flatten() {
            if !spec.model.labels().contains(&tag.as_str()) {
                return Err(ClassifyError::UnsupportedTag {
                    model: spec.model.name(),
                    tag: tag.clone(),
                });
            }
        }
        Ok(Self {
            spec,
            threshold,
            tags,
        })
    }

    pub fn spec(&self) -> &ClassifierSpec {
        &self.spec
    }

    /// Tags for one file. A failing detector yields no tags.
    pub fn classify(
        &self,
        detector: &dyn Detector,
        path: &Path,
        cache: Option<&DetectionCache>,
    ) -> TagMap {
        let detections = self.detections(detector, path, cache);
        debug!(
            "{} model={}:{} detections={:?}",
            path.display(),
            self.spec.model.name(),
            if self.spec.backend.is_empty() { "default" } else { self.spec.backend.as_str() },
            detections
        );
        self.interpret(&detections)
    }

    fn detections(
        &self,
        detector: &dyn Detector,
        path: &Path,
        cache: Option<&DetectionCache>,
    ) -> Vec<Detection> {
        let (model, backend) = (self.spec.model.name(), self.spec.backend.as_str());
        if let Some(cache) = cache.filter(|c| !c.refresh) {
            match cache.manifest.get_detections(path, model, backend) {
                Ok(Some(found)) if !found.is_empty() => return found,
                Ok(_) => {}
                Err(e) => warn!("{}: cannot read cached detections: {:#}", path.display(), e),
            }
        }

        let found = match detector.detect(&self.spec, path) {
            Ok(d) => d,
            Err(e) => {
                debug!("Error classifying {}: {:#}", path.display(), e);
                return Vec::new();
            }
        };
        // empty results are retried on the next run
        if let Some(cache) = cache.filter(|_| !found.is_empty()) {
            if let Err(e) = cache.manifest.set_detections(path, model, backend, &found) {
                warn!("{}: cannot cache detections: {:#}", path.display(), e);
            }
        }
        found
    }

    /// Turn raw detections into `label -> metadata` tags.
    pub fn interpret(&self, detections: &[Detection]) -> TagMap {
        let mut out = TagMap::new();
        for d in detections {
            let Some((label, mut meta)) = self.label_of(d) else {
                continue;
            };
            if self.tags.as_ref().is_some_and(|t| !t.contains(&label)) {
                continue;
            }
            meta.insert("model".into(), Value::String(self.spec.model.name().into()));
            out.insert(label, Value::Object(meta));
        }
        out
    }

    fn label_of(&self, d: &Detection) -> Option<(String, Detection)> {
        match self.spec.model {
            Model::NudeNet => {
                let class = d.get("class")?.as_str()?.to_string();
                if let Some(t) = self.threshold {
                    let score = d.get("score").and_then(Value::as_f64).unwrap_or(0.0);
                    if score <= t {
                        return None;
                    }
                }
                let mut meta = d.clone();
                meta.remove("class");
                Some((class, meta))
            }
            Model::Age => {
                let age = d.get("age")?.as_f64()?;
                Some((age_label(age).to_string(), d.clone()))
            }
            model => {
                let (dominant, scores) = model.dominant_key()?;
                let label = d.get(dominant)?.as_str()?.to_string();
                if let Some(t) = self.threshold {
                    let any_above = d
                        .get(scores)
                        .and_then(Value::as_object)
                        .is_some_and(|s| s.values().filter_map(Value::as_f64).any(|v| v > t));
                    if !any_above {
                        return None;
                    }
                }
                Some((label, d.clone()))
            }
        }
    }
}

/// Raw detector output kept in the manifest, keyed by file, model and backend.
#[derive(Debug, Clone, Copy)]
pub struct DetectionCache<'a> {
    pub manifest: &'a Manifest,
    /// Ignore stored results and run the detector again
    pub refresh: bool,
}

/// Run every classifier on `path` and combine their tags.
pub fn classify_file(
    classifiers: &[Classifier],
    detector: &dyn Detector,
    path: &Path,
    cache: Option<&DetectionCache>,
) -> TagMap {
    let mut tags = TagMap::new();
    for c in classifiers {
        tags.extend(c.classify(detector, path, cache));
    }
    tags
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Fixed(Vec<Detection>);

    impl Detector for Fixed {
        fn detect(&self, _: &ClassifierSpec, _: &Path) -> anyhow::Result<Vec<Detection>> {
            Ok(self.0.clone())
        }
    }

    struct Failing;

    impl Detector for Failing {
        fn detect(&self, _: &ClassifierSpec, _: &Path) -> anyhow::Result<Vec<Detection>> {
            bail!("model not installed")
        }
    }

    fn detections(v: Value) -> Vec<Detection> {
        v.as_array()
            .unwrap()
            .iter()
            .map(|d| d.as_object().unwrap().clone())
            .collect()
    }

    #[test]
    fn test_spec_parse() {
        let s: ClassifierSpec = "age".parse().unwrap();
        assert_eq!(s.model, Model::Age);
        assert_eq!(s.backend, "opencv");
        let s: ClassifierSpec = "emotion:retinaface".parse().unwrap();
        assert_eq!(s.backend, "retinaface");
        assert!(matches!(
            "age:VGG-Face".parse::<ClassifierSpec>(),
            Err(ClassifyError::UnsupportedBackend { .. })
        ));
        assert!(matches!(
            "cats".parse::<ClassifierSpec>(),
            Err(ClassifyError::UnknownModel(_))
        ));
        assert_eq!("nudenet".parse::<ClassifierSpec>().unwrap().backend, "");
    }

    #[test]
    fn test_unsupported_tag() {
        let spec: ClassifierSpec = "age".parse().unwrap();
        assert!(Classifier::new(spec.clone(), None, Some(vec!["baby".into()])).is_ok());
        assert!(matches!(
            Classifier::new(spec, None, Some(vec!["Woman".into()])),
            Err(ClassifyError::UnsupportedTag { .. })
        ));
    }

    #[test]
    fn test_age_labels() {
        assert_eq!(age_label(1.0), "baby");
        assert_eq!(age_label(3.0), "toddler");
        assert_eq!(age_label(15.0), "teenager");
        assert_eq!(age_label(35.0), "adult");
        assert_eq!(age_label(60.0), "elderly");
    }

    #[test]
    fn test_age_interpretation() {
        let c = Classifier::new("age".parse().unwrap(), None, None).unwrap();
        let found = detections(json!([{"age": 2, "face_confidence": 0.9}]));
        let tags = c.classify(&Fixed(found), Path::new("/x.jpg"), None);
        assert_eq!(
            Value::Object(tags),
            json!({"baby": {"age": 2, "face_confidence": 0.9, "model": "age"}})
        );
    }

    #[test]
    fn test_nudenet_threshold_and_filter() {
        let found = detections(json!([
            {"class": "FACE_FEMALE", "score": 0.9, "box": [1, 2, 3, 4]},
            {"class": "FEET_EXPOSED", "score": 0.3},
            {"score": 0.99}
        ]));
        let c = Classifier::new("nudenet".parse().unwrap(), Some(0.5), None).unwrap();
        let tags = c.interpret(&found);
        assert_eq!(
            Value::Object(tags),
            json!({"FACE_FEMALE": {"score": 0.9, "box": [1, 2, 3, 4], "model": "nudenet"}})
        );

        let c = Classifier::new(
            "nudenet".parse().unwrap(),
            None,
            Some(vec!["FEET_EXPOSED".into()]),
        )
        .unwrap();
        let tags = c.interpret(&found);
        assert_eq!(tags.keys().collect::<Vec<_>>(), vec!["FEET_EXPOSED"]);
    }

    #[test]
    fn test_dominant_label_with_threshold() {
        let found = detections(json!([
            {"dominant_emotion": "happy", "emotion": {"happy": 80.0, "sad": 20.0}},
            {"dominant_emotion": "sad", "emotion": {"happy": 45.0, "sad": 55.0}}
        ]));
        let c = Classifier::new("emotion".parse().unwrap(), Some(60.0), None).unwrap();
        let tags = c.interpret(&found);
        assert_eq!(tags.len(), 1);
        assert_eq!(tags["happy"]["model"], "emotion");
        assert_eq!(tags["happy"]["dominant_emotion"], "happy");
    }

    #[test]
    fn test_failing_detector_yields_nothing() {
        let c = Classifier::new("gender".parse().unwrap(), None, None).unwrap();
        assert!(c.classify(&Failing, Path::new("/x.jpg"), None).is_empty());
    }

    #[test]
    fn test_classify_file_combines_models() {
        let found = detections(json!([
            {"age": 30, "dominant_gender": "Man", "gender": {"Man": 99.0, "Woman": 1.0}}
        ]));
        let classifiers = vec![
            Classifier::new("age".parse().unwrap(), None, None).unwrap(),
            Classifier::new("gender".parse().unwrap(), None, None).unwrap(),
        ];
        let tags = classify_file(&classifiers, &Fixed(found), Path::new("/x.jpg"), None);
        assert_eq!(tags.len(), 2);
        assert_eq!(tags["adult"]["model"], "age");
        assert_eq!(tags["Man"]["model"], "gender");
    }

    struct Counting {
        found: Vec<Detection>,
        calls: std::sync::atomic::AtomicUsize,
    }

    impl Counting {
        fn new(found: Vec<Detection>) -> Self {
            Self { found, calls: Default::default() }
        }

        fn calls(&self) -> usize {
            self.calls.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    impl Detector for Counting {
        fn detect(&self, _: &ClassifierSpec, _: &Path) -> anyhow::Result<Vec<Detection>> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(self.found.clone())
        }
    }

    #[test]
    fn test_cached_detections_skip_the_detector() {
        let manifest = Manifest::open_in_memory().unwrap();
        let path = Path::new("/library/kid.jpg");
        let c = Classifier::new("age".parse().unwrap(), None, None).unwrap();
        let detector = Counting::new(detections(json!([{"age": 2}])));
        let cache = DetectionCache { manifest: &manifest, refresh: false };

        let first = c.classify(&detector, path, Some(&cache));
        let second = c.classify(&detector, path, Some(&cache));
        assert_eq!(detector.calls(), 1);
        assert_eq!(first, second);
        assert!(second.contains_key("baby"));

        // another backend is a different cache entry
        let ssd = Classifier::new("age:ssd".parse().unwrap(), None, None).unwrap();
        ssd.classify(&detector, path, Some(&cache));
        assert_eq!(detector.calls(), 2);

        let refresh = DetectionCache { manifest: &manifest, refresh: true };
        c.classify(&detector, path, Some(&refresh));
        assert_eq!(detector.calls(), 3);
        c.classify(&detector, path, None);
        assert_eq!(detector.calls(), 4);
    }

    #[test]
    fn test_empty_detections_are_not_cached() {
        let manifest = Manifest::open_in_memory().unwrap();
        let path = Path::new("/library/landscape.jpg");
        let c = Classifier::new("age".parse().unwrap(), None, None).unwrap();
        let detector = Counting::new(Vec::new());
        let cache = DetectionCache { manifest: &manifest, refresh: false };

        assert!(c.classify(&detector, path, Some(&cache)).is_empty());
        assert!(c.classify(&detector, path, Some(&cache)).is_empty());
        assert_eq!(detector.calls(), 2);
    }

    #[test]
    fn test_missing_command() {
        let d = CommandDetector::default();
        assert!(!d.has_command(Model::Age));
        assert!(d.detect(&"age".parse().unwrap(), Path::new("/x.jpg")).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_command_detector() {
        let mut commands = HashMap::new();
        commands.insert(
            "age".to_string(),
            vec![
                "sh".to_string(),
                "-c".to_string(),
                r#"printf '[{"age": 70, "file": "%s", "backend": "%s"}]' "$0" "$1""#.to_string(),
                "{file}".to_string(),
                "{backend}".to_string(),
            ],
        );
        let d = CommandDetector::new(commands);
        let found = d
            .detect(&"age:ssd".parse().unwrap(), Path::new("/photos/a.jpg"))
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["file"], "/photos/a.jpg");
        assert_eq!(found[0]["backend"], "ssd");
    }
}
