//! Topic-to-connection allocation

/// Subscription limit of a single broker connection
pub const MAX_TOPICS_PER_CONNECTION: usize = 50;

/// Split topics into consecutive chunks of at most `size`, one per data connection
pub fn chunk_topics(topics: &[String], size: usize) -> Vec<Vec<String>> {
    topics.chunks(size.max(1)).map(<[String]>::to_vec).collect()
}
