//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 基于下标的双向侵入式链表
//!
//! 参考 Linux: include/linux/list.h
//!
//! 节点存放在稠密数组（或槽位表）中，链接字段保存的是数组下标而不是指针：
//! - 伙伴系统: 页帧 ↔ free_area
//! - Slab: full/partial/empty 链表
//! - 页面回收: active/inactive 链表
//! - 压缩缓存: LRU 链表
//!
//! 一个节点同一时刻只能挂在一条链表上。

/// 链表节点链接
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Links {
    pub prev: Option<u32>,
    pub next: Option<u32>,
}

/// 嵌入链接字段的节点类型
pub trait Linked {
    fn links(&self) -> &Links;
    fn links_mut(&mut self) -> &mut Links;
}

/// 可按下标访问节点的容器
pub trait LinkArena {
    fn links(&self, idx: u32) -> &Links;
    fn links_mut(&mut self, idx: u32) -> &mut Links;
}

impl<T: Linked> LinkArena for [T] {
    #[inline]
    fn links(&self, idx: u32) -> &Links {
        self[idx as usize].links()
    }

    #[inline]
    fn links_mut(&mut self, idx: u32) -> &mut Links {
        self[idx as usize].links_mut()
    }
}

impl<T: Linked> LinkArena for alloc::vec::Vec<Option<T>> {
    fn links(&self, idx: u32) -> &Links {
        match self.get(idx as usize) {
            Some(Some(node)) => node.links(),
            _ => panic!("list: dangling node index {}", idx),
        }
    }

    fn links_mut(&mut self, idx: u32) -> &mut Links {
        match self.get_mut(idx as usize) {
            Some(Some(node)) => node.links_mut(),
            _ => panic!("list: dangling node index {}", idx),
        }
    }
}

/// 链表头
#[derive(Debug, Clone, Copy, Default)]
pub struct ListHead {
    head: Option<u32>,
    tail: Option<u32>,
    len: usize,
}

impl ListHead {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn first(&self) -> Option<u32> {
        self.head
    }

    #[inline]
    pub fn last(&self) -> Option<u32> {
        self.tail
    }

    /// 插入链表头部
    pub fn push_front<A: LinkArena + ?Sized>(&mut self, arena: &mut A, idx: u32) {
        *arena.links_mut(idx) = Links {
            prev: None,
            next: self.head,
        };
        match self.head {
            Some(h) => arena.links_mut(h).prev = Some(idx),
            None => self.tail = Some(idx),
        }
        self.head = Some(idx);
        self.len += 1;
    }

    /// 插入链表尾部
    pub fn push_back<A: LinkArena + ?Sized>(&mut self, arena: &mut A, idx: u32) {
        *arena.links_mut(idx) = Links {
            prev: self.tail,
            next: None,
        };
        match self.tail {
            Some(t) => arena.links_mut(t).next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
        self.len += 1;
    }

    /// 从链表摘除（调用者保证 idx 在本链表上）
    pub fn remove<A: LinkArena + ?Sized>(&mut self, arena: &mut A, idx: u32) {
        let Links { prev, next } = *arena.links(idx);
        match prev {
            Some(p) => arena.links_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => arena.links_mut(n).prev = prev,
            None => self.tail = prev,
        }
        *arena.links_mut(idx) = Links::default();
        self.len -= 1;
    }

    pub fn pop_front<A: LinkArena + ?Sized>(&mut self, arena: &mut A) -> Option<u32> {
        let idx = self.head?;
        self.remove(arena, idx);
        Some(idx)
    }

    pub fn pop_back<A: LinkArena + ?Sized>(&mut self, arena: &mut A) -> Option<u32> {
        let idx = self.tail?;
        self.remove(arena, idx);
        Some(idx)
    }

    /// 移到链表头部
    pub fn move_to_front<A: LinkArena + ?Sized>(&mut self, arena: &mut A, idx: u32) {
        if self.head != Some(idx) {
            self.remove(arena, idx);
            self.push_front(arena, idx);
        }
    }

    /// 从头到尾遍历
    pub fn iter<'a, A: LinkArena + ?Sized>(&self, arena: &'a A) -> Iter<'a, A> {
        Iter {
            arena,
            cur: self.head,
        }
    }
}

pub struct Iter<'a, A: LinkArena + ?Sized> {
    arena: &'a A,
    cur: Option<u32>,
}

impl<'a, A: LinkArena + ?Sized> Iterator for Iter<'a, A> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        let idx = self.cur?;
        self.cur = self.arena.links(idx).next;
        Some(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    #[derive(Default)]
    struct Node {
        links: Links,
    }

    impl Linked for Node {
        fn links(&self) -> &Links {
            &self.links
        }
        fn links_mut(&mut self) -> &mut Links {
            &mut self.links
        }
    }

    #[test]
    fn test_push_remove() {
        let mut nodes: Vec<Node> = (0..4).map(|_| Node::default()).collect();
        let mut list = ListHead::new();
        list.push_back(nodes.as_mut_slice(), 0);
        list.push_back(nodes.as_mut_slice(), 1);
        list.push_front(nodes.as_mut_slice(), 2);
        assert_eq!(list.iter(nodes.as_slice()).collect::<Vec<_>>(), [2, 0, 1]);

        list.remove(nodes.as_mut_slice(), 0);
        assert_eq!(list.len(), 2);
        assert_eq!(list.iter(nodes.as_slice()).collect::<Vec<_>>(), [2, 1]);

        list.move_to_front(nodes.as_mut_slice(), 1);
        assert_eq!(list.first(), Some(1));
        assert_eq!(list.last(), Some(2));

        assert_eq!(list.pop_back(nodes.as_mut_slice()), Some(2));
        assert_eq!(list.pop_front(nodes.as_mut_slice()), Some(1));
        assert!(list.is_empty());
        assert_eq!(list.pop_front(nodes.as_mut_slice()), None);
    }

    #[test]
    fn test_slot_arena() {
        let mut slots: Vec<Option<Node>> = Vec::new();
        slots.push(Some(Node::default()));
        slots.push(None);
        slots.push(Some(Node::default()));
        let mut list = ListHead::new();
        list.push_front(&mut slots, 0);
        list.push_front(&mut slots, 2);
        assert_eq!(list.iter(&slots).collect::<Vec<_>>(), [2, 0]);
    }
}
