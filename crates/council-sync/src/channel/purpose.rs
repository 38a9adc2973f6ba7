use std::fmt;

/// One logical channel of the session view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelPurpose {
    /// Topic tally snapshots, scoped by session.
    Vote,
    /// Currently presented topic id, scoped by session.
    Presenter,
    /// `NEW_TOPIC` notices, scoped by session.
    NewTopic,
    /// `NEW_AMENDMENT` / `DELETE_AMENDMENT_{id}` notices, scoped by session.
    NewAmendment,
    /// Amendment tally snapshots, scoped by amendment.
    AmendmentVote,
}

impl ChannelPurpose {
    pub const ALL: [ChannelPurpose; 5] = [
        ChannelPurpose::Vote,
        ChannelPurpose::Presenter,
        ChannelPurpose::NewTopic,
        ChannelPurpose::NewAmendment,
        ChannelPurpose::AmendmentVote,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelPurpose::Vote => "vote",
            ChannelPurpose::Presenter => "presenter",
            ChannelPurpose::NewTopic => "new_topic",
            ChannelPurpose::NewAmendment => "new_amendment",
            ChannelPurpose::AmendmentVote => "amendment_vote",
        }
    }

    pub fn inbound_template(&self) -> &'static str {
        match self {
            ChannelPurpose::Vote => "/topic/sessions/{id}",
            ChannelPurpose::Presenter => "/topic/presenters/{id}",
            ChannelPurpose::NewTopic => "/topic/newTopics/{id}",
            ChannelPurpose::NewAmendment => "/topic/newAmendments/{id}",
            ChannelPurpose::AmendmentVote => "/topic/amendments/{id}",
        }
    }

    pub fn outbound_template(&self) -> Option<&'static str> {
        Some(match self {
            ChannelPurpose::Vote => "/app/vote/{id}",
            ChannelPurpose::Presenter => "/app/presenter/{id}",
            ChannelPurpose::NewTopic => "/app/topics/new/{id}",
            ChannelPurpose::NewAmendment => "/app/amendments/new/{id}",
            ChannelPurpose::AmendmentVote => "/app/amendments/vote/{id}",
        })
    }

    pub fn spec(&self) -> ChannelSpec {
        ChannelSpec {
            purpose: *self,
            inbound: self.inbound_template().to_string(),
            outbound: self.outbound_template().map(str::to_string),
            queueing: true,
        }
    }
}

impl fmt::Display for ChannelPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Destination templates plus delivery options for one channel.
/// `{id}` in a template is replaced by the scope id on `open`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub purpose: ChannelPurpose,
    pub inbound: String,
    pub outbound: Option<String>,
    /// When false, sends that cannot go out right away are discarded.
    pub queueing: bool,
}

impl ChannelSpec {
    pub fn with_queueing(mut self, queueing: bool) -> Self {
        self.queueing = queueing;
        self
    }

    pub fn with_inbound(mut self, template: impl Into<String>) -> Self {
        self.inbound = template.into();
        self
    }

    pub fn with_outbound(mut self, template: Option<String>) -> Self {
        self.outbound = template;
        self
    }

    pub fn resolve(&self, scope: u64) -> Destinations {
        let id = scope.to_string();
        Destinations {
            inbound: self.inbound.replace("{id}", &id),
            outbound: self.outbound.as_ref().map(|t| t.replace("{id}", &id)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destinations {
    pub inbound: String,
    pub outbound: Option<String>,
}
