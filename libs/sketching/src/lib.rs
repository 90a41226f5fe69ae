#![deny(warnings)]
#![warn(unused_extern_crates)]
#![allow(non_snake_case)]
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing_forest::printer::TestCapturePrinter;
use tracing_forest::tag::NoTag;
use tracing_forest::util::*;
use tracing_forest::Tag;
use tracing::Level;
use tracing_subscriber::prelude::*;

pub mod macros;

pub use {tracing, tracing_forest, tracing_subscriber};

/// Start up the logging for test mode.
pub fn test_init() {
    let filter = EnvFilter::from_default_env()
        .add_directive(LevelFilter::TRACE.into())
        // hyper is very chatty about connection handling during the web tests.
        .add_directive("hyper=INFO".parse().expect("failed to generate log filter"));

    let _ = tracing_subscriber::Registry::default()
        .with(ForestLayer::new(TestCapturePrinter::new(), NoTag).with_filter(filter))
        .try_init();
}

/// Map the numeric `event_tag_id` field of an event back into a forest tag.
pub fn event_tagger(event: &Event) -> Option<Tag> {
    let mut visitor = TagVisitor(None);
    event.record(&mut visitor);
    let tag = visitor.0?;

    let (level, icon) = match tag {
        EventTag::AdminDebug | EventTag::SecurityDebug | EventTag::FlowTrace => {
            (Level::DEBUG, tag.emoji())
        }
        EventTag::AdminError
        | EventTag::RequestError
        | EventTag::SecurityError
        | EventTag::FlowError
        | EventTag::SourceError => (Level::ERROR, tag.emoji()),
        EventTag::AdminWarn | EventTag::RequestWarn | EventTag::FlowWarn | EventTag::SourceWarn => {
            (Level::WARN, tag.emoji())
        }
        _ => (Level::INFO, tag.emoji()),
    };

    Some(
        Tag::builder()
            .level(level)
            .icon(icon.chars().next().unwrap_or(' '))
            .prefix(tag.prefix())
            .suffix(tag.suffix())
            .build(),
    )
}

struct TagVisitor(Option<EventTag>);

impl tracing::field::Visit for TagVisitor {
    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        if field.name() == "event_tag_id" {
            self.0 = EventTag::try_from(value).ok();
        }
    }

    fn record_debug(&mut self, _field: &tracing::field::Field, _value: &dyn std::fmt::Debug) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u64)]
pub enum EventTag {
    AdminDebug,
    AdminError,
    AdminWarn,
    AdminInfo,
    RequestError,
    RequestWarn,
    RequestInfo,
    RequestTrace,
    SecurityCritical,
    SecurityDebug,
    SecurityInfo,
    SecurityAccess,
    SecurityError,
    FlowError,
    FlowWarn,
    FlowInfo,
    FlowTrace,
    SourceError,
    SourceWarn,
    SourceInfo,
}

impl EventTag {
    pub fn pretty(self) -> &'static str {
        match self {
            EventTag::AdminDebug => "admin.debug",
            EventTag::AdminError => "admin.error",
            EventTag::AdminWarn => "admin.warn",
            EventTag::AdminInfo => "admin.info",
            EventTag::RequestError => "request.error",
            EventTag::RequestWarn => "request.warn",
            EventTag::RequestInfo => "request.info",
            EventTag::RequestTrace => "request.trace",
            EventTag::SecurityCritical => "security.critical",
            EventTag::SecurityDebug => "security.debug",
            EventTag::SecurityInfo => "security.info",
            EventTag::SecurityAccess => "security.access",
            EventTag::SecurityError => "security.error",
            EventTag::FlowError => "flow.error",
            EventTag::FlowWarn => "flow.warn",
            EventTag::FlowInfo => "flow.info",
            EventTag::FlowTrace => "flow.trace",
            EventTag::SourceError => "source.error",
            EventTag::SourceWarn => "source.warn",
            EventTag::SourceInfo => "source.info",
        }
    }

    fn prefix(self) -> &'static str {
        self.pretty().split('.').next().unwrap_or("")
    }

    fn suffix(self) -> &'static str {
        self.pretty().split('.').nth(1).unwrap_or("")
    }

    pub fn emoji(self) -> &'static str {
        use EventTag::*;
        match self {
            AdminDebug | SecurityDebug => "🐛",
            AdminError | FlowError | RequestError | SecurityError | SourceError => "🚨",
            AdminWarn | FlowWarn | RequestWarn | SourceWarn => "⚠️",
            AdminInfo | FlowInfo | RequestInfo | SecurityInfo | SourceInfo => "ℹ️",
            RequestTrace | FlowTrace => "📍",
            SecurityCritical => "🔐",
            SecurityAccess => "🔓",
        }
    }
}
