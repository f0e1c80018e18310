// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Prompt assembly for the fleet. Kept string-first so the templates are
//! auditable at a glance; callers pass the already-rendered transcript.

/// Classifier: structured verdict, JSON only.
pub fn classifier(question: &str) -> String {
    format!(
        "You are the intake classifier of a mathematics tutoring service.\n\
         Classify the student question below.\n\n\
         Question: {question}\n\n\
         Reply with a single JSON object and nothing else:\n\
         {{\"knowledge_code\": \"K1|K2|K3|K4\", \
           \"decision\": \"answerable|needs_clarify\", \
           \"math_relatedness\": 0.0}}\n\
         K1 = arithmetic, K2 = algebra, K3 = geometry, K4 = analysis.\n\
         Use needs_clarify when the question is too vague to answer."
    )
}

/// Clarifier planning pass: up to `max` questions as a JSON array.
pub fn clarify_plan(question: &str, max: usize) -> String {
    format!(
        "A student asked a question that is too vague to answer directly:\n\n\
         {question}\n\n\
         Write at most {max} short clarification questions that would make\n\
         it answerable. Reply with a JSON array of strings and nothing else."
    )
}

/// Answerer: full streamed answer over the session transcript.
pub fn answer(transcript: &str) -> String {
    format!(
        "You are MAICE, a patient mathematics tutor. Use the conversation\n\
         below, including any clarification answers, to give a complete,\n\
         step-by-step answer. Use LaTeX for formulas.\n\n\
         {transcript}\n\
         maice:"
    )
}

/// Observer: one-paragraph session summary.
pub fn summary(transcript: &str) -> String {
    format!(
        "Summarize this tutoring exchange in one short paragraph: what was\n\
         asked, what was answered, and any follow-up the student may need.\n\n\
         {transcript}"
    )
}

/// Image-to-LaTeX: single non-streamed conversion.
pub fn image_to_latex(image_ref: &str) -> String {
    format!(
        "Transcribe the mathematical content of the attached image into\n\
         LaTeX. Reply with the LaTeX source only.\n\
         Image: {image_ref}"
    )
}

/// Free talk: conversational, no rubric.
pub fn free_talk(transcript: &str) -> String {
    format!(
        "You are MAICE in free-talk mode: a friendly math-savvy\n\
         conversation partner. Continue the conversation naturally.\n\n\
         {transcript}\n\
         maice:"
    )
}
