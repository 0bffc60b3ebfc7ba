use crate::actuator::Utterance;
use std::fmt::Write;

/// Builds the inline-annotated text the animated-speech channel understands:
///
/// ```text
/// ^start(<gesture>) \vct=<pitch%>\\rspd=<rate%>\\vol=<volume>\\pau=<pause ms>\<sentence>
/// ```
///
/// The gesture directive and its trailing space are omitted when no gesture is
/// attached. Backslashes in the sentence are dropped so spoken text can never open a
/// directive of its own.
pub fn annotate(utterance: &Utterance) -> String {
    let mut out = String::with_capacity(utterance.text.len() + 64);
    if let Some(gesture) = &utterance.gesture {
        let _ = write!(out, "^start({gesture}) ");
    }
    let p = &utterance.prosody;
    let _ = write!(
        out,
        "\\vct={}\\\\rspd={}\\\\vol={}\\\\pau={}\\",
        percent(p.pitch),
        percent(p.rate),
        p.volume.min(100),
        p.pause_ms
    );
    out.extend(utterance.text.trim().chars().filter(|c| *c != '\\'));
    out
}

fn percent(multiplier: f32) -> u32 {
    (multiplier * 100.0).round().max(0.0) as u32
}
